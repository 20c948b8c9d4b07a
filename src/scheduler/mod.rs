/// Job table entries, status and configuration
pub mod job;

/// Consumers of job outcomes
pub mod processor;

/// Tick loop and job dispatch
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use job::{job_id, ScheduledJob, SchedulerConfig, SchedulerInfo, SchedulerStatus};
#[cfg(test)]
pub use processor::MockJobProcessor;
pub use processor::{JobProcessor, LoggingJobProcessor};
pub use scheduler::Scheduler;
