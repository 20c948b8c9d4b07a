//! Shared building blocks for collector implementations
//!
//! [`BaseCollector`] carries the lifecycle, statistics and retry plumbing that
//! every concrete collector needs, so that an implementation only has to
//! provide the code that talks to its resource.

use chrono::Utc;
use log::{info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::traits::{CollectorConfig, CollectorInfo, CollectorStatus};
use crate::error::ClassifiedError;
use crate::events::{CollectionResult, Labels, MetricObservation, Timestamp};
use crate::resilience::{
    BoxError, CircuitBreaker, CircuitBreakerPolicy, DefaultRetryPolicy, ResilientExecutor,
};

/// Label identifying the producing collector; callers cannot override it
pub const COLLECTOR_LABEL: &str = "collector";

/// Builds metric observations carrying a collector's common labels
#[derive(Debug, Clone)]
pub struct MetricBuilder {
    collector: String,
    common: Labels,
}

impl MetricBuilder {
    pub fn new(collector: impl Into<String>, common: Labels) -> Self {
        Self {
            collector: collector.into(),
            common,
        }
    }

    /// Create an observation timestamped now
    ///
    /// Caller labels win over common labels, common labels only fill in
    /// missing keys, and the `collector` label is always this collector.
    pub fn metric(&self, name: impl Into<String>, value: f64, unit: impl Into<String>, labels: Labels) -> MetricObservation {
        self.stamp(MetricObservation {
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            labels,
            description: None,
        })
    }

    /// Apply the common labels and the `collector` label to an observation
    /// built elsewhere, with the same precedence as [`MetricBuilder::metric`]
    pub fn stamp(&self, mut metric: MetricObservation) -> MetricObservation {
        for (key, value) in &self.common {
            metric.labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
        metric
            .labels
            .insert(COLLECTOR_LABEL.to_string(), self.collector.clone());
        metric
    }
}

#[derive(Debug)]
struct CollectorState {
    status: CollectorStatus,
    started_at: Option<Timestamp>,
    last_collection: Option<Timestamp>,
    last_success: Option<Instant>,
    last_error: Option<ClassifiedError>,
    metrics_collected: u64,
    error_count: u64,
    successful_collections: u64,
}

/// Lifecycle, statistics and retrying collection shared by all collectors
#[derive(Debug)]
pub struct BaseCollector {
    name: String,
    description: String,
    config: CollectorConfig,
    executor: ResilientExecutor,
    breaker: Option<Arc<CircuitBreaker>>,
    metrics: MetricBuilder,
    state: Mutex<CollectorState>,
}

impl BaseCollector {
    pub fn new(name: impl Into<String>, description: impl Into<String>, config: CollectorConfig) -> Self {
        let name = name.into();
        let executor = ResilientExecutor::new(name.as_str(), config.retry.clone());

        let mut common = Labels::new();
        common.insert("service".to_string(), config.service.clone());
        for (key, value) in &config.custom_labels {
            common.insert(key.clone(), value.clone());
        }
        let metrics = MetricBuilder::new(name.as_str(), common);

        Self {
            name,
            description: description.into(),
            config,
            executor,
            breaker: None,
            metrics,
            state: Mutex::new(CollectorState {
                status: CollectorStatus::Stopped,
                started_at: None,
                last_collection: None,
                last_success: None,
                last_error: None,
                metrics_collected: 0,
                error_count: 0,
                successful_collections: 0,
            }),
        }
    }

    /// Route retries through a (possibly shared) circuit breaker
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        let policy = CircuitBreakerPolicy::new(
            DefaultRetryPolicy::new(self.config.retry.clone()),
            Arc::clone(&breaker),
        );
        self.executor =
            ResilientExecutor::with_policy(self.name.as_str(), self.config.retry.clone(), Arc::new(policy));
        self.breaker = Some(breaker);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricBuilder {
        &self.metrics
    }

    pub fn status(&self) -> CollectorStatus {
        self.state.lock().unwrap().status
    }

    /// Validate configuration and move to `Running`
    ///
    /// # Errors
    ///
    /// Returns a configuration error (and enters the `Error` state) when the
    /// interval or attempt timeout is zero, or no targets are configured.
    pub fn start(&self) -> Result<(), ClassifiedError> {
        let mut state = self.state.lock().unwrap();
        if state.status == CollectorStatus::Running {
            return Ok(());
        }

        info!("Starting collector {}", self.name);
        state.status = CollectorStatus::Starting;

        if let Err(err) = self.validate_config() {
            warn!("Collector {} failed validation: {}", self.name, err);
            state.status = CollectorStatus::Error;
            state.last_error = Some(err.clone());
            return Err(err);
        }

        state.status = CollectorStatus::Running;
        state.started_at = Some(Utc::now());
        info!(
            "Collector {} started for targets: {:?}",
            self.name, self.config.targets
        );
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == CollectorStatus::Stopped {
            return;
        }
        state.status = CollectorStatus::Stopped;
        info!("Collector {} stopped", self.name);
    }

    fn validate_config(&self) -> Result<(), ClassifiedError> {
        if self.config.interval.is_zero() {
            return Err(ClassifiedError::configuration(
                "INVALID_INTERVAL",
                "collection interval must be positive",
            ));
        }
        if self.config.retry.attempt_timeout.is_zero() {
            return Err(ClassifiedError::configuration(
                "INVALID_TIMEOUT",
                "collection timeout must be positive",
            ));
        }
        if self.config.targets.is_empty() {
            return Err(ClassifiedError::configuration(
                "NO_TARGETS",
                "no targets enabled for collection",
            ));
        }
        Ok(())
    }

    /// Run `work` through the resilient executor and build the result
    ///
    /// A failed execution yields a result with an error and no metrics; the
    /// number of attempts and metrics is recorded in the result metadata.
    pub async fn collect_with_retry<F, Fut>(&self, token: &CancellationToken, target: &str, work: F) -> CollectionResult
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Vec<MetricObservation>, BoxError>>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();

        let execution = self.executor.execute(token, target, work).await;

        let mut result = CollectionResult::new(self.name.as_str(), target, started_at)
            .with_duration(clock.elapsed())
            .with_metadata("attempts", execution.attempts);

        match execution.outcome {
            Ok(metrics) => {
                result.metrics = metrics.into_iter().map(|m| self.metrics.stamp(m)).collect();
                self.record_success(result.metrics.len());
            }
            Err(err) => {
                self.record_error(&err);
                result.set_error(err);
            }
        }

        let metric_count = result.metrics.len();
        result.with_metadata("metric_count", metric_count)
    }

    fn record_success(&self, metric_count: usize) {
        let mut state = self.state.lock().unwrap();
        state.successful_collections += 1;
        state.metrics_collected += metric_count as u64;
        state.last_collection = Some(Utc::now());
        state.last_success = Some(Instant::now());
    }

    fn record_error(&self, err: &ClassifiedError) {
        let mut state = self.state.lock().unwrap();
        state.error_count += 1;
        state.last_collection = Some(Utc::now());
        state.last_error = Some(err.clone());
    }

    pub fn info(&self) -> CollectorInfo {
        let state = self.state.lock().unwrap();
        let mut metadata = std::collections::BTreeMap::new();
        if let Some(started_at) = state.started_at {
            metadata.insert("started_at".to_string(), serde_json::json!(started_at.to_rfc3339()));
        }
        if let Some(breaker) = &self.breaker {
            if let Ok(value) = serde_json::to_value(breaker.status()) {
                metadata.insert("circuit_breaker".to_string(), value);
            }
        }

        CollectorInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            status: state.status,
            targets: self.config.targets.clone(),
            interval: self.config.interval,
            last_collection: state.last_collection,
            last_error: state.last_error.clone(),
            metrics_collected: state.metrics_collected,
            error_count: state.error_count,
            successful_collections: state.successful_collections,
            metadata,
        }
    }

    /// Health of the collector
    ///
    /// A running collector is healthy when it succeeded within two intervals
    /// or its error rate is at most 50%.
    pub fn health(&self) -> Result<(), ClassifiedError> {
        let state = self.state.lock().unwrap();
        match state.status {
            CollectorStatus::Running => {
                let recent = state
                    .last_success
                    .map_or(false, |at| at.elapsed() < self.config.interval * 2);
                if recent {
                    return Ok(());
                }

                let total = state.successful_collections + state.error_count;
                if total > 0 && state.error_count * 2 > total {
                    return Err(ClassifiedError::validation(
                        "HIGH_ERROR_RATE",
                        format!(
                            "collector {} has high error rate: {} of {} collections failed",
                            self.name, state.error_count, total
                        ),
                    ));
                }
                Ok(())
            }
            CollectorStatus::Error => Err(state.last_error.clone().unwrap_or_else(|| {
                ClassifiedError::internal("COLLECTOR_ERROR", format!("collector {} is in error state", self.name))
            })),
            CollectorStatus::Stopped => Err(ClassifiedError::validation(
                "COLLECTOR_STOPPED",
                format!("collector {} is stopped", self.name),
            )),
            CollectorStatus::Starting | CollectorStatus::Stopping => Err(ClassifiedError::validation(
                "COLLECTOR_NOT_READY",
                format!("collector {} is not ready", self.name),
            )),
        }
    }
}
