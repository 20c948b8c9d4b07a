use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ClassifiedError;
use crate::events::{CollectionResult, Labels, Timestamp};
use crate::resilience::RetryConfig;

/// Boxed future returned by the async methods of [`Collector`]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A named collection unit that produces metrics for a target
///
/// Implementations must allow `collect` to run concurrently for different
/// targets. The scheduler and registry only ever see collectors through this
/// trait.
pub trait Collector: Send + Sync {
    /// Unique name, used as the `collector` label and in job ids
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Prepare the collector; calling it on a running collector is a no-op
    fn start<'a>(&'a self, token: &'a CancellationToken) -> BoxFuture<'a, Result<(), ClassifiedError>>;

    fn stop<'a>(&'a self, token: &'a CancellationToken) -> BoxFuture<'a, Result<(), ClassifiedError>>;

    /// Collect metrics for one target
    ///
    /// Failures are reported inside the returned result, never as a panic.
    fn collect<'a>(&'a self, token: CancellationToken, target: &'a str) -> BoxFuture<'a, CollectionResult>;

    /// Status snapshot and statistics
    fn info(&self) -> CollectorInfo;

    /// `Ok(())` when the collector is able to do its job
    fn health(&self) -> Result<(), ClassifiedError>;
}

/// Lifecycle state of a collector
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CollectorStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Status and statistics of a collector
#[derive(Debug, Clone, Serialize)]
pub struct CollectorInfo {
    pub name: String,
    pub description: String,
    pub status: CollectorStatus,
    pub targets: Vec<String>,
    pub interval: Duration,
    pub last_collection: Option<Timestamp>,
    pub last_error: Option<ClassifiedError>,
    /// Total metric observations produced
    pub metrics_collected: u64,
    pub error_count: u64,
    pub successful_collections: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Per-collector configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub enabled: bool,
    /// How often each target is collected
    pub interval: Duration,
    /// Targets this collector is scheduled for
    pub targets: Vec<String>,
    pub retry: RetryConfig,
    /// Value of the common `service` label
    pub service: String,
    /// Extra labels added to every metric
    pub custom_labels: Labels,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            targets: Vec::new(),
            retry: RetryConfig::default(),
            service: crate::SERVICE_NAME.to_string(),
            custom_labels: Labels::new(),
        }
    }
}
