use serde::Serialize;
use std::time::Duration;

use crate::error::ClassifiedError;
use crate::events::{CollectionResult, Timestamp};

/// Deterministic job id for a collector and target
pub fn job_id(collector_name: &str, target: &str) -> String {
    format!("{}-{}", collector_name, target)
}

/// One recurring (collector, target) pairing
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub id: String,
    pub collector_name: String,
    pub target: String,
    pub interval: Duration,
    /// Earliest time of the next dispatch
    pub next_run: Timestamp,
    pub last_run: Option<Timestamp>,
    pub last_result: Option<CollectionResult>,
    pub enabled: bool,
}

impl ScheduledJob {
    pub fn new(collector_name: &str, target: &str, interval: Duration, next_run: Timestamp) -> Self {
        Self {
            id: job_id(collector_name, target),
            collector_name: collector_name.to_string(),
            target: target.to_string(),
            interval,
            next_run,
            last_run: None,
            last_result: None,
            enabled: true,
        }
    }
}

/// Lifecycle state of the scheduler
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Status and counters of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerInfo {
    pub status: SchedulerStatus,
    pub start_time: Option<Timestamp>,
    pub job_count: usize,
    pub active_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub last_tick: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// How often the loop looks for due jobs
    pub tick_interval: Duration,
    /// Ceiling on simultaneously executing jobs
    pub max_concurrent_jobs: usize,
    /// Deadline for one job execution, retries included
    pub job_timeout: Duration,
    /// When non-empty, only these targets are scheduled
    pub enabled_targets: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_concurrent_jobs: 10,
            job_timeout: Duration::from_secs(300),
            enabled_targets: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ClassifiedError> {
        if self.tick_interval.is_zero() {
            return Err(ClassifiedError::configuration(
                "INVALID_TICK_INTERVAL",
                "tick interval must be positive",
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ClassifiedError::configuration(
                "INVALID_MAX_CONCURRENT_JOBS",
                "max concurrent jobs must be positive",
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(ClassifiedError::configuration(
                "INVALID_JOB_TIMEOUT",
                "job timeout must be positive",
            ));
        }
        Ok(())
    }

    /// Whether `target` passes the allow-list
    pub fn allows_target(&self, target: &str) -> bool {
        self.enabled_targets.is_empty() || self.enabled_targets.iter().any(|t| t == target)
    }
}
