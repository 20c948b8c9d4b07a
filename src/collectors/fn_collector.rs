use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::base::{BaseCollector, MetricBuilder};
use super::traits::{BoxFuture, Collector, CollectorConfig, CollectorInfo};
use crate::error::ClassifiedError;
use crate::events::{CollectionResult, MetricObservation};
use crate::resilience::{BoxError, CircuitBreaker};

/// Input handed to the closure of a [`FnCollector`] on every attempt
#[derive(Debug, Clone)]
pub struct CollectRequest {
    /// Cancelled when the attempt times out or the job is cancelled
    pub token: CancellationToken,
    pub target: String,
    /// Builder stamping the collector's common labels on observations
    pub metrics: MetricBuilder,
}

/// Collector backed by an async closure
///
/// This is how resource-specific collection logic plugs into the agent: the
/// closure performs one attempt and everything else (retries, statistics,
/// lifecycle) comes from [`BaseCollector`].
///
/// # Example
///
/// ```
/// use harvester::collectors::{CollectorConfig, FnCollector};
/// use harvester::events::Labels;
///
/// let collector = FnCollector::new("queue", "Queue depth", CollectorConfig::default(), |req| async move {
///     let depth = req.metrics.metric("queue_depth", 12.0, "count", Labels::new());
///     Ok(vec![depth])
/// });
/// ```
pub struct FnCollector<F> {
    base: BaseCollector,
    collect_fn: F,
}

impl<F, Fut> FnCollector<F>
where
    F: Fn(CollectRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<MetricObservation>, BoxError>> + Send,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        config: CollectorConfig,
        collect_fn: F,
    ) -> Self {
        Self {
            base: BaseCollector::new(name, description, config),
            collect_fn,
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.base = self.base.with_circuit_breaker(breaker);
        self
    }
}

impl<F, Fut> Collector for FnCollector<F>
where
    F: Fn(CollectRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<MetricObservation>, BoxError>> + Send,
{
    fn name(&self) -> &str {
        self.base.name()
    }

    fn description(&self) -> &str {
        self.base.description()
    }

    fn start<'a>(&'a self, _token: &'a CancellationToken) -> BoxFuture<'a, Result<(), ClassifiedError>> {
        Box::pin(async move { self.base.start() })
    }

    fn stop<'a>(&'a self, _token: &'a CancellationToken) -> BoxFuture<'a, Result<(), ClassifiedError>> {
        Box::pin(async move {
            self.base.stop();
            Ok(())
        })
    }

    fn collect<'a>(&'a self, token: CancellationToken, target: &'a str) -> BoxFuture<'a, CollectionResult> {
        Box::pin(async move {
            self.base
                .collect_with_retry(&token, target, |attempt_token| {
                    (self.collect_fn)(CollectRequest {
                        token: attempt_token,
                        target: target.to_string(),
                        metrics: self.base.metrics().clone(),
                    })
                })
                .await
        })
    }

    fn info(&self) -> CollectorInfo {
        self.base.info()
    }

    fn health(&self) -> Result<(), ClassifiedError> {
        self.base.health()
    }
}
