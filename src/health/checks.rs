use log::debug;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::types::{CheckResult, HealthStatus};
use crate::collectors::{BoxFuture, CollectorRegistry};
use crate::error::ClassifiedError;
use crate::scheduler::Scheduler;

/// A named probe contributing to the overall health
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Run the probe; `token` is cancelled when the check's deadline passes
    fn check<'a>(&'a self, token: CancellationToken) -> BoxFuture<'a, CheckResult>;
}

/// Reports that the service process is up
#[derive(Debug, Clone)]
pub struct BasicCheck {
    service: String,
    version: String,
}

impl BasicCheck {
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
        }
    }
}

impl HealthCheck for BasicCheck {
    fn name(&self) -> &str {
        "basic"
    }

    fn check<'a>(&'a self, _token: CancellationToken) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            CheckResult::healthy(self.name(), format!("{} is running", self.service))
                .with_metadata("service", self.service.as_str())
                .with_metadata("version", self.version.as_str())
        })
    }
}

/// Maps the scheduler's own health onto a check result
#[derive(Debug, Clone)]
pub struct SchedulerCheck {
    scheduler: Scheduler,
}

impl SchedulerCheck {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

impl HealthCheck for SchedulerCheck {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn check<'a>(&'a self, _token: CancellationToken) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            let info = self.scheduler.status();
            let result = match self.scheduler.health() {
                Ok(()) => CheckResult::healthy(self.name(), "Scheduler is running"),
                Err(e) => CheckResult::unhealthy(self.name(), e.to_string()),
            };
            result
                .with_metadata("jobs", info.job_count)
                .with_metadata("active_jobs", info.active_jobs)
                .with_metadata("completed_jobs", info.completed_jobs)
                .with_metadata("failed_jobs", info.failed_jobs)
        })
    }
}

/// Health of the registered collectors
///
/// All healthy is healthy, some failing is degraded and all failing is
/// unhealthy. An empty registry has nothing to report.
#[derive(Debug, Clone)]
pub struct RegistryCheck {
    registry: Arc<CollectorRegistry>,
}

impl RegistryCheck {
    pub fn new(registry: Arc<CollectorRegistry>) -> Self {
        Self { registry }
    }
}

impl HealthCheck for RegistryCheck {
    fn name(&self) -> &str {
        "collectors"
    }

    fn check<'a>(&'a self, _token: CancellationToken) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            let collectors = self.registry.list();
            if collectors.is_empty() {
                return CheckResult::unknown(self.name(), "No collectors registered");
            }

            let failing: Vec<(String, ClassifiedError)> = collectors
                .iter()
                .filter_map(|c| c.health().err().map(|e| (c.name().to_string(), e)))
                .collect();
            let total = collectors.len();
            let failing_names: Vec<&str> = failing.iter().map(|(name, _)| name.as_str()).collect();

            let result = if failing.is_empty() {
                CheckResult::healthy(self.name(), format!("All {} collectors healthy", total))
            } else if failing.len() < total {
                CheckResult::degraded(
                    self.name(),
                    format!("{} of {} collectors unhealthy", failing.len(), total),
                )
                .with_error(describe(&failing))
            } else {
                CheckResult::unhealthy(self.name(), format!("All {} collectors unhealthy", total))
                    .with_error(describe(&failing))
            };
            result
                .with_metadata("collectors", total)
                .with_metadata("failing", failing_names)
        })
    }
}

fn describe(failing: &[(String, ClassifiedError)]) -> String {
    failing
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reports configuration problems found at startup
///
/// No issues is healthy, up to two is degraded, more is unhealthy.
#[derive(Debug, Clone)]
pub struct ConfigCheck {
    issues: Vec<String>,
}

impl ConfigCheck {
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }
}

impl HealthCheck for ConfigCheck {
    fn name(&self) -> &str {
        "configuration"
    }

    fn check<'a>(&'a self, _token: CancellationToken) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            let listed = self.issues.join(", ");
            let result = match self.issues.len() {
                0 => CheckResult::healthy(self.name(), "Configuration is valid"),
                1 | 2 => CheckResult::degraded(self.name(), format!("Configuration has minor issues: {}", listed)),
                _ => CheckResult::new(
                    self.name(),
                    HealthStatus::Unhealthy,
                    format!("Configuration has significant issues: {}", listed),
                )
                .with_error(format!("Configuration validation failed: {}", listed)),
            };
            result.with_metadata("issues", self.issues.clone())
        })
    }
}

/// Probes HTTP endpoints the agent depends on
///
/// An endpoint is reachable when it answers with a non-5xx status.
#[derive(Debug, Clone)]
pub struct ConnectivityCheck {
    client: Client,
    endpoints: Vec<String>,
}

impl ConnectivityCheck {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, ClassifiedError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("{}/{}", crate::SERVICE_NAME, crate::VERSION))
            .build()
            .map_err(|e| ClassifiedError::configuration("HTTP_CLIENT", "failed to build HTTP client").with_cause(e))?;
        Ok(Self { client, endpoints })
    }

    async fn reachable(&self, token: &CancellationToken, endpoint: &str) -> Result<(), String> {
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err("check cancelled".to_string()),
            response = self.client.get(endpoint).send() => response.map_err(|e| e.to_string())?,
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        Ok(())
    }
}

impl HealthCheck for ConnectivityCheck {
    fn name(&self) -> &str {
        "connectivity"
    }

    fn check<'a>(&'a self, token: CancellationToken) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            if self.endpoints.is_empty() {
                return CheckResult::degraded(self.name(), "No endpoints configured");
            }

            let mut unreachable = Vec::new();
            for endpoint in &self.endpoints {
                match self.reachable(&token, endpoint).await {
                    Ok(()) => debug!("Endpoint {} is reachable", endpoint),
                    Err(e) => {
                        debug!("Endpoint {} is unreachable: {}", endpoint, e);
                        unreachable.push(format!("{} ({})", endpoint, e));
                    }
                }
            }

            let total = self.endpoints.len();
            let reachable = total - unreachable.len();
            let result = if unreachable.is_empty() {
                CheckResult::healthy(self.name(), format!("All {} endpoints reachable", total))
            } else if reachable > 0 {
                CheckResult::degraded(self.name(), format!("{} of {} endpoints reachable", reachable, total))
                    .with_error(format!("unreachable: {}", unreachable.join(", ")))
            } else {
                CheckResult::unhealthy(self.name(), format!("No endpoints reachable: {}", unreachable.join(", ")))
            };
            result
                .with_metadata("endpoints", self.endpoints.clone())
                .with_metadata("reachable", reachable)
        })
    }
}
