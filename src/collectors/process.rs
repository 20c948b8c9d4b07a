//! Self-monitoring collector for the agent process
//!
//! Reports the resident memory, peak memory, thread count and uptime of the
//! running agent so that the agent is observable through its own pipeline.

use log::debug;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::base::BaseCollector;
use super::traits::{BoxFuture, Collector, CollectorConfig, CollectorInfo};
use crate::error::ClassifiedError;
use crate::events::{CollectionResult, Labels, MetricObservation};
use crate::resilience::CircuitBreaker;

/// Name under which the process collector registers
pub const PROCESS_COLLECTOR: &str = "process";

/// Raw figures read from the operating system
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSnapshot {
    pub resident_bytes: Option<u64>,
    pub peak_resident_bytes: Option<u64>,
    pub threads: Option<u64>,
}

impl ProcessSnapshot {
    /// Read the current process figures
    pub fn capture() -> Self {
        let mut snapshot = Self::default();

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                snapshot = Self::parse_proc_status(&status);
            }
        }

        if snapshot.peak_resident_bytes.is_none() {
            snapshot.peak_resident_bytes = peak_rss_bytes();
        }
        if snapshot.resident_bytes.is_none() {
            // Peak usage is the best available approximation
            snapshot.resident_bytes = snapshot.peak_resident_bytes;
        }

        snapshot
    }

    /// Parse the `VmRSS`, `VmHWM` and `Threads` fields of `/proc/<pid>/status`
    pub fn parse_proc_status(status: &str) -> Self {
        let mut snapshot = Self::default();

        for line in status.lines() {
            let mut fields = line.split_whitespace();
            let key = fields.next();
            let value = fields.next().and_then(|v| v.parse::<u64>().ok());

            match key {
                Some("VmRSS:") => snapshot.resident_bytes = value.map(|kb| kb * 1024),
                Some("VmHWM:") => snapshot.peak_resident_bytes = value.map(|kb| kb * 1024),
                Some("Threads:") => snapshot.threads = value,
                _ => {}
            }
        }

        snapshot
    }
}

#[cfg(unix)]
fn peak_rss_bytes() -> Option<u64> {
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }

        // ru_maxrss is in KB on Linux, bytes on macOS
        #[cfg(target_os = "macos")]
        let bytes = usage.ru_maxrss as u64;
        #[cfg(not(target_os = "macos"))]
        let bytes = usage.ru_maxrss as u64 * 1024;

        Some(bytes)
    }
}

#[cfg(not(unix))]
fn peak_rss_bytes() -> Option<u64> {
    None
}

/// Collector reporting the agent's own resource usage
pub struct ProcessCollector {
    base: BaseCollector,
    started: Instant,
}

impl ProcessCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            base: BaseCollector::new(
                PROCESS_COLLECTOR,
                "Resource usage of the agent process",
                config,
            ),
            started: Instant::now(),
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.base = self.base.with_circuit_breaker(breaker);
        self
    }

    fn observe(&self, target: &str) -> Result<Vec<MetricObservation>, ClassifiedError> {
        let snapshot = ProcessSnapshot::capture();
        debug!("Process snapshot for {}: {:?}", target, snapshot);

        let builder = self.base.metrics();
        let labels = || {
            let mut labels = Labels::new();
            labels.insert("target".to_string(), target.to_string());
            labels
        };

        let mut metrics = Vec::new();
        if let Some(bytes) = snapshot.resident_bytes {
            metrics.push(
                builder
                    .metric("process_resident_memory_bytes", bytes as f64, "bytes", labels())
                    .with_description("Resident memory of the agent process"),
            );
        }
        if let Some(bytes) = snapshot.peak_resident_bytes {
            metrics.push(
                builder
                    .metric("process_peak_memory_bytes", bytes as f64, "bytes", labels())
                    .with_description("Peak resident memory of the agent process"),
            );
        }
        if let Some(threads) = snapshot.threads {
            metrics.push(builder.metric("process_threads", threads as f64, "count", labels()));
        }

        if metrics.is_empty() {
            return Err(ClassifiedError::dependency(
                "PROCESS_STATS_UNAVAILABLE",
                "unable to read process statistics from the operating system",
            ));
        }

        metrics.push(builder.metric(
            "process_uptime_seconds",
            self.started.elapsed().as_secs_f64(),
            "seconds",
            labels(),
        ));

        Ok(metrics)
    }
}

impl Collector for ProcessCollector {
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
                    let outcome = self.observe(target).map_err(Into::into);
                    async move { outcome }
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
