//! HTTP endpoint probe collector
//!
//! Each target is a URL. A probe issues one GET request and reports latency,
//! status code and availability; failures are classified so that the
//! resilient executor can decide whether to retry.

use log::debug;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::base::{BaseCollector, MetricBuilder};
use super::traits::{BoxFuture, Collector, CollectorConfig, CollectorInfo};
use crate::error::{ClassifiedError, ErrorCategory};
use crate::events::{CollectionResult, Labels, MetricObservation};
use crate::resilience::CircuitBreaker;

/// Delay suggested when a 429 response carries no usable Retry-After header
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// Collector probing HTTP endpoints
pub struct HttpCollector {
    base: BaseCollector,
    client: Client,
}

impl HttpCollector {
    /// Create a probe collector named `name`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(name: impl Into<String>, config: CollectorConfig) -> Result<Self, ClassifiedError> {
        let client = Client::builder()
            .timeout(config.retry.attempt_timeout)
            .user_agent(concat!("harvester/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ClassifiedError::configuration("HTTP_CLIENT", format!("failed to build HTTP client: {}", e))
                    .with_cause(e)
            })?;

        Ok(Self {
            base: BaseCollector::new(name, "HTTP endpoint availability and latency", config),
            client,
        })
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.base = self.base.with_circuit_breaker(breaker);
        self
    }
}

async fn probe(client: Client, metrics: MetricBuilder, url: String) -> Result<Vec<MetricObservation>, ClassifiedError> {
    let started = Instant::now();
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| classify_transport_error(&url, e))?;
    let latency = started.elapsed();
    let status = response.status();
    debug!("Probe of {} returned {} in {:?}", url, status, latency);

    if let Some(err) = classify_status(&url, status, response.headers()) {
        return Err(err);
    }

    let mut labels = Labels::new();
    labels.insert("url".to_string(), url);

    Ok(vec![
        metrics
            .metric("http_probe_duration_seconds", latency.as_secs_f64(), "seconds", labels.clone())
            .with_description("Time until response headers were received"),
        metrics.metric("http_probe_status_code", f64::from(status.as_u16()), "code", labels.clone()),
        metrics.metric("http_probe_up", 1.0, "bool", labels),
    ])
}

fn classify_transport_error(url: &str, err: reqwest::Error) -> ClassifiedError {
    let classified = if err.is_timeout() {
        ClassifiedError::new(
            ErrorCategory::Timeout,
            "TIMEOUT",
            format!("request to {} timed out", url),
        )
        .with_retryable(true)
    } else if err.is_connect() {
        ClassifiedError::connectivity("CONNECTION_FAILED", format!("failed to connect to {}: {}", url, err))
    } else if err.is_builder() {
        ClassifiedError::validation("INVALID_URL", format!("invalid probe target {}: {}", url, err))
    } else {
        ClassifiedError::connectivity("NETWORK_ERROR", format!("request to {} failed: {}", url, err))
    };
    classified.with_operation("http_probe").with_cause(err)
}

fn classify_status(url: &str, status: StatusCode, headers: &reqwest::header::HeaderMap) -> Option<ClassifiedError> {
    let code = format!("HTTP_{}", status.as_u16());
    let message = format!("{} returned {}", url, status);

    let err = if status == StatusCode::TOO_MANY_REQUESTS {
        let delay = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RATE_LIMIT_DELAY);
        ClassifiedError::rate_limited(delay)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ClassifiedError::permission("http_probe", url)
    } else if status.is_server_error() {
        ClassifiedError::dependency(code, message).with_retryable(true)
    } else if status.is_client_error() {
        ClassifiedError::validation(code, message)
    } else {
        return None;
    };

    Some(err.with_operation("http_probe"))
}

impl Collector for HttpCollector {
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
                .collect_with_retry(&token, target, |_| {
                    let request = probe(self.client.clone(), self.base.metrics().clone(), target.to_string());
                    async move { request.await.map_err(Into::into) }
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
