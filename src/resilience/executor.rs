use log::{debug, log};
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::retry::{DefaultRetryPolicy, RetryConfig, RetryPolicy};
use crate::error::ClassifiedError;

/// Error type accepted from units of work
///
/// Returning a [`ClassifiedError`] keeps its classification, anything else is
/// classified as an internal error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one resilient execution
#[derive(Debug)]
pub struct Execution<T> {
    pub outcome: Result<T, ClassifiedError>,
    /// Attempts actually made; zero when the policy refused to start
    pub attempts: u32,
}

/// Runs units of work with bounded retries, backoff and a per-attempt timeout
///
/// The retry policy is picked at construction time: a [`DefaultRetryPolicy`]
/// or a [`CircuitBreakerPolicy`](super::CircuitBreakerPolicy) wrapping a
/// shared breaker. Breaker bookkeeping happens once per execution, with the
/// final outcome, not once per attempt.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    operation: String,
    config: RetryConfig,
    policy: Arc<dyn RetryPolicy>,
}

impl ResilientExecutor {
    /// Create an executor using the default retry policy
    pub fn new(operation: impl Into<String>, config: RetryConfig) -> Self {
        let policy = Arc::new(DefaultRetryPolicy::new(config.clone()));
        Self::with_policy(operation, config, policy)
    }

    pub fn with_policy(operation: impl Into<String>, config: RetryConfig, policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            operation: operation.into(),
            config,
            policy,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.policy
    }

    /// Execute `work` against `target` until it succeeds or retries run out
    ///
    /// Each attempt receives a child of `token` and runs under the configured
    /// attempt timeout. Cancelling `token` aborts the current attempt or
    /// backoff wait immediately.
    ///
    /// # Arguments
    ///
    /// * `token` - Cancellation handle of the surrounding job
    /// * `target` - Target label attached to errors (e.g. a region)
    /// * `work` - Factory producing one attempt of the unit of work
    pub async fn execute<T, F, Fut>(&self, token: &CancellationToken, target: &str, mut work: F) -> Execution<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        if !self.policy.permits_attempt() {
            let err = ClassifiedError::circuit_open(&self.operation)
                .with_operation(self.operation.as_str())
                .with_target(target);
            self.log_final(&err, 0);
            return Execution {
                outcome: Err(err),
                attempts: 0,
            };
        }

        let mut attempts = 0;
        loop {
            if token.is_cancelled() {
                let err = self.contextualize(ClassifiedError::cancelled("execution cancelled"), target);
                self.log_final(&err, attempts);
                return Execution {
                    outcome: Err(err),
                    attempts,
                };
            }

            let attempt_token = token.child_token();
            let timeout = self.config.attempt_timeout;
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ClassifiedError::cancelled("execution cancelled")),
                result = tokio::time::timeout(timeout, work(attempt_token.clone())) => match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(ClassifiedError::from_error(err)),
                    Err(_) => Err(ClassifiedError::timeout(self.operation.as_str(), timeout)),
                },
            };
            attempt_token.cancel();

            let attempt = attempts;
            attempts += 1;

            let err = match outcome {
                Ok(value) => {
                    self.policy.record_success();
                    if attempts > 1 {
                        debug!(
                            "{} on {} succeeded after {} attempts",
                            self.operation, target, attempts
                        );
                    }
                    return Execution {
                        outcome: Ok(value),
                        attempts,
                    };
                }
                Err(err) => self.contextualize(err, target),
            };

            // Cancellation is not a dependency failure, keep the breaker out of it
            if token.is_cancelled() {
                self.log_final(&err, attempts);
                return Execution {
                    outcome: Err(err),
                    attempts,
                };
            }

            if !self.policy.should_retry(&err, attempt) {
                self.policy.record_failure(&err);
                self.log_final(&err, attempts);
                return Execution {
                    outcome: Err(err),
                    attempts,
                };
            }

            let delay = self.policy.retry_delay(&err, attempt);
            debug!(
                "{} on {} failed (attempt {}), retrying in {:?}: {}",
                self.operation, target, attempts, delay, err
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let err = self.contextualize(ClassifiedError::cancelled("cancelled during backoff"), target);
                    self.log_final(&err, attempts);
                    return Execution {
                        outcome: Err(err),
                        attempts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn contextualize(&self, mut err: ClassifiedError, target: &str) -> ClassifiedError {
        if err.operation.is_none() {
            err.operation = Some(self.operation.clone());
        }
        if err.target.is_none() {
            err.target = Some(target.to_string());
        }
        err
    }

    fn log_final(&self, err: &ClassifiedError, attempts: u32) {
        log!(
            err.severity.log_level(),
            "{} failed after {} attempt(s): {}",
            self.operation,
            attempts,
            err
        );
    }
}
