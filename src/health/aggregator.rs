//! Health aggregator
//!
//! Runs the registered checks concurrently, keeps the latest result of each
//! and reduces them into one overall status.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::checks::HealthCheck;
use super::types::{CheckResult, HealthStatus, OverallHealth};
use crate::error::ClassifiedError;

/// Deadline applied to every individual check
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

struct Runner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    service: String,
    version: String,
    started: Instant,
    checks: Mutex<BTreeMap<String, Arc<dyn HealthCheck>>>,
    results: Mutex<BTreeMap<String, CheckResult>>,
    runner: Mutex<Option<Runner>>,
}

/// Collects health check results and reduces them to one status
#[derive(Clone)]
pub struct HealthAggregator {
    inner: Arc<Inner>,
    check_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: service.into(),
                version: version.into(),
                started: Instant::now(),
                checks: Mutex::new(BTreeMap::new()),
                results: Mutex::new(BTreeMap::new()),
                runner: Mutex::new(None),
            }),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    /// Override the per-check deadline
    pub fn with_check_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self
    }

    /// Add a check, replacing any check with the same name
    pub fn register_check(&self, check: Arc<dyn HealthCheck>) {
        let name = check.name().to_string();
        if self.inner.checks.lock().unwrap().insert(name.clone(), check).is_some() {
            warn!("Replaced health check {}", name);
        } else {
            info!("Registered health check {}", name);
        }
    }

    /// Remove a check together with its last result
    pub fn unregister_check(&self, name: &str) -> bool {
        let mut results = self.inner.results.lock().unwrap();
        let removed = self.inner.checks.lock().unwrap().remove(name).is_some();
        results.remove(name);
        drop(results);
        if removed {
            info!("Unregistered health check {}", name);
        }
        removed
    }

    pub fn check_names(&self) -> Vec<String> {
        self.inner.checks.lock().unwrap().keys().cloned().collect()
    }

    /// Run every registered check once, concurrently
    ///
    /// Each check gets its own deadline. A check that times out or panics is
    /// recorded as unhealthy. If `token` is cancelled before all checks have
    /// finished, the partial results are dropped and the previous results stay.
    pub async fn run_checks(&self, token: &CancellationToken) {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .inner
            .checks
            .lock()
            .unwrap()
            .iter()
            .map(|(name, check)| (name.clone(), Arc::clone(check)))
            .collect();

        if checks.is_empty() {
            debug!("No health checks registered");
            return;
        }

        let mut running = JoinSet::new();
        for (name, check) in checks {
            running.spawn(run_one(name, check, token.child_token(), self.check_timeout));
        }

        let mut collected = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    running.abort_all();
                    debug!("Health check run cancelled, dropping {} partial results", collected.len());
                    return;
                }
                next = running.join_next() => match next {
                    Some(Ok(result)) => collected.push(result),
                    Some(Err(e)) => warn!("Health check task failed: {}", e),
                    None => break,
                },
            }
        }

        // Membership must be read under the results lock
        let mut results = self.inner.results.lock().unwrap();
        let registered = self.check_names();
        for result in collected {
            debug!(
                "Health check {} is {} ({:?}): {}",
                result.name, result.status, result.duration, result.message
            );
            // Unregistered while running
            if registered.contains(&result.name) {
                results.insert(result.name.clone(), result);
            }
        }
    }

    /// Current overall health, built from the latest results
    pub fn get_health(&self) -> OverallHealth {
        let checks = self.inner.results.lock().unwrap().clone();
        let (status, summary) = aggregate_status(checks.values().map(|result| result.status));

        OverallHealth {
            status,
            timestamp: Utc::now(),
            uptime: self.inner.started.elapsed(),
            version: self.inner.version.clone(),
            service: self.inner.service.clone(),
            checks,
            summary,
        }
    }

    /// Run the checks now and then every `interval` until stopped
    ///
    /// Must be called from within a Tokio runtime. A no-op if already running.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `interval` is zero.
    pub fn start(&self, interval: Duration) -> Result<(), ClassifiedError> {
        if interval.is_zero() {
            return Err(ClassifiedError::configuration(
                "INVALID_HEALTH_INTERVAL",
                "health check interval must be positive",
            ));
        }

        let mut runner = self.inner.runner.lock().unwrap();
        if runner.is_some() {
            return Ok(());
        }

        info!("Starting health checks every {:?}", interval);
        let token = CancellationToken::new();
        let aggregator = self.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            aggregator.run_checks(&loop_token).await;

            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => aggregator.run_checks(&loop_token).await,
                }
            }
        });

        *runner = Some(Runner { token, handle });
        Ok(())
    }

    /// Stop the periodic runs; a no-op if not running
    pub async fn stop(&self) {
        let Some(runner) = self.inner.runner.lock().unwrap().take() else {
            return;
        };

        runner.token.cancel();
        if let Err(e) = runner.handle.await {
            warn!("Health check loop ended abnormally: {}", e);
        }
        info!("Health checks stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.runner.lock().unwrap().is_some()
    }
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("service", &self.inner.service)
            .field("checks", &self.check_names())
            .finish()
    }
}

/// Run one check in its own task so that a panic or an overrun stays local
async fn run_one(
    name: String,
    check: Arc<dyn HealthCheck>,
    token: CancellationToken,
    check_timeout: Duration,
) -> CheckResult {
    let last_checked = Utc::now();
    let clock = Instant::now();

    let check_token = token.clone();
    let mut handle = tokio::spawn(async move { check.check(check_token).await });

    let mut result = match tokio::time::timeout(check_timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => {
            warn!("Health check {} panicked", name);
            CheckResult::unhealthy(name.as_str(), format!("health check {} panicked", name))
        }
        Ok(Err(e)) => CheckResult::unhealthy(name.as_str(), format!("health check {} failed: {}", name, e)),
        Err(_) => {
            handle.abort();
            warn!("Health check {} timed out after {:?}", name, check_timeout);
            CheckResult::unhealthy(
                name.as_str(),
                format!("health check {} timed out after {:?}", name, check_timeout),
            )
        }
    };
    token.cancel();

    result.name = name;
    result.last_checked = last_checked;
    result.duration = clock.elapsed();
    result
}

/// Reduce individual statuses to one overall status and a summary
///
/// Any unhealthy check makes the whole unhealthy, then any degraded check
/// makes it degraded. Unknown results next to healthy ones degrade the
/// overall status rather than being ignored.
pub fn aggregate_status(statuses: impl IntoIterator<Item = HealthStatus>) -> (HealthStatus, String) {
    let (mut healthy, mut unhealthy, mut degraded, mut unknown) = (0, 0, 0, 0);
    for status in statuses {
        match status {
            HealthStatus::Healthy => healthy += 1,
            HealthStatus::Unhealthy => unhealthy += 1,
            HealthStatus::Degraded => degraded += 1,
            HealthStatus::Unknown => unknown += 1,
        }
    }

    let total = healthy + unhealthy + degraded + unknown;
    if total == 0 {
        return (HealthStatus::Unknown, "No health checks configured".to_string());
    }

    let status = if unhealthy > 0 {
        HealthStatus::Unhealthy
    } else if degraded > 0 {
        HealthStatus::Degraded
    } else if unknown == total {
        HealthStatus::Unknown
    } else if healthy == total {
        HealthStatus::Healthy
    } else if unknown > 0 && healthy > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unknown
    };

    (status, summary(healthy, unhealthy, degraded, unknown, total))
}

fn summary(healthy: usize, unhealthy: usize, degraded: usize, unknown: usize, total: usize) -> String {
    if total == 1 {
        return match (healthy, unhealthy, degraded) {
            (1, _, _) => "All systems operational",
            (_, 1, _) => "System experiencing issues",
            (_, _, 1) => "System performance degraded",
            _ => "System status unknown",
        }
        .to_string();
    }

    if unhealthy > 0 {
        format!("{} of {} checks failing", unhealthy, total)
    } else if degraded > 0 {
        format!("{} of {} checks degraded", degraded, total)
    } else if unknown > 0 && healthy > 0 {
        format!("{} of {} checks healthy, {} unknown", healthy, total, unknown)
    } else if healthy == total {
        "All systems operational".to_string()
    } else {
        format!(
            "{} checks total: {} healthy, {} degraded, {} unhealthy, {} unknown",
            total, healthy, degraded, unhealthy, unknown
        )
    }
}
