//! Orchestration core of a metrics collection agent.
//!
//! Collectors are registered in a [`collectors::CollectorRegistry`], scheduled
//! per target by the [`scheduler::Scheduler`], run through a retrying,
//! circuit-breaking [`resilience::ResilientExecutor`] and observed through the
//! [`health::HealthAggregator`].

/// Classified errors and component error types
pub mod error;

/// Metric observations and collection results
pub mod events;

/// Retry policies, circuit breaker and resilient executor
pub mod resilience;

/// Collector contract, registry and built-in collectors
pub mod collectors;

/// Recurring job scheduler
pub mod scheduler;

/// Health checks and aggregation
pub mod health;

/// Configuration management
pub mod config;

/// Service name used as the default `service` label
pub const SERVICE_NAME: &str = "harvester";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use collectors::{Collector, CollectorRegistry};
pub use error::{ClassifiedError, ConfigError, ErrorCategory, ProcessorError, RegistryError, Severity};
pub use health::HealthAggregator;
pub use scheduler::Scheduler;
