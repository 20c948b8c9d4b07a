/// Check results and overall health snapshot
pub mod types;

/// Health check contract and the built-in checks
pub mod checks;

/// Concurrent check runner and status reduction
pub mod aggregator;

pub use aggregator::{aggregate_status, HealthAggregator, DEFAULT_CHECK_TIMEOUT};
pub use checks::{BasicCheck, ConfigCheck, ConnectivityCheck, HealthCheck, RegistryCheck, SchedulerCheck};
pub use types::{CheckResult, HealthStatus, OverallHealth};
