use log::{error, info};

use super::job::ScheduledJob;
use crate::error::{ClassifiedError, ProcessorError};
use crate::events::CollectionResult;

/// Consumer of job outcomes
///
/// Called synchronously by the scheduler after every execution, with no
/// scheduler lock held. A returned error is logged and otherwise ignored.
#[cfg_attr(test, mockall::automock)]
pub trait JobProcessor: Send + Sync {
    fn process_result(&self, job: &ScheduledJob, result: &CollectionResult) -> Result<(), ProcessorError>;

    fn process_error(&self, job: &ScheduledJob, err: &ClassifiedError) -> Result<(), ProcessorError>;
}

/// Processor that writes every outcome to the log
#[derive(Debug, Default)]
pub struct LoggingJobProcessor;

impl JobProcessor for LoggingJobProcessor {
    fn process_result(&self, job: &ScheduledJob, result: &CollectionResult) -> Result<(), ProcessorError> {
        info!(
            "Job {} collected {} metrics from {} in {:?}",
            job.id,
            result.metrics.len(),
            job.target,
            result.duration
        );
        Ok(())
    }

    fn process_error(&self, job: &ScheduledJob, err: &ClassifiedError) -> Result<(), ProcessorError> {
        error!(
            "Job {} failed for {} on {} ({}): {}",
            job.id, job.collector_name, job.target, err.category, err
        );
        Ok(())
    }
}
