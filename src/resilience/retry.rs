use rand::Rng;
use std::fmt;
use std::time::Duration;

use crate::error::ClassifiedError;

/// Retry configuration for a resilient executor
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = retries + 1)
    pub retries: u32,
    /// Delay before the first retry, doubled on every subsequent one
    pub base_delay: Duration,
    /// Lower bound of any computed backoff
    pub min_delay: Duration,
    /// Upper bound of any computed backoff
    pub max_delay: Duration,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_secs(1),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Decides whether and when a failed attempt is retried
///
/// Attempts are numbered from zero: `attempt` is the index of the attempt
/// that just failed. The bookkeeping hooks let stateful policies such as a
/// circuit breaker observe outcomes; the default implementations do nothing.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    fn should_retry(&self, err: &ClassifiedError, attempt: u32) -> bool;

    fn retry_delay(&self, err: &ClassifiedError, attempt: u32) -> Duration;

    /// Whether a new execution may start at all
    fn permits_attempt(&self) -> bool {
        true
    }

    fn record_success(&self) {}

    fn record_failure(&self, _err: &ClassifiedError) {}
}

/// Retry policy driven purely by error retryability and the attempt budget
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy {
    config: RetryConfig,
}

impl DefaultRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, err: &ClassifiedError, attempt: u32) -> bool {
        attempt < self.config.retries && err.is_retryable()
    }

    fn retry_delay(&self, err: &ClassifiedError, attempt: u32) -> Duration {
        match err.retry_after {
            Some(delay) => delay,
            None => backoff_delay(&self.config, attempt),
        }
    }
}

/// Exponential backoff with ±25% jitter, clamped to the configured bounds
///
/// # Arguments
///
/// * `config` - Retry configuration supplying base, minimum and maximum delays
/// * `attempt` - Zero-based index of the attempt that just failed
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2f64.powi(attempt.min(32) as i32);
    let delay = config.base_delay.as_secs_f64() * factor;
    let jitter = delay * 0.25 * rand::thread_rng().gen_range(-1.0..=1.0);

    let secs = (delay + jitter)
        .min(config.max_delay.as_secs_f64())
        .max(0.0);

    Duration::from_secs_f64(secs)
        .max(config.min_delay)
        .min(config.max_delay)
}
