/// Collector contract, status and configuration types
pub mod traits;

/// Shared lifecycle, statistics and metric construction
pub mod base;

/// Collector registry
pub mod registry;

/// Closure-backed collector
pub mod fn_collector;

/// Agent self-monitoring collector
pub mod process;

/// HTTP endpoint probe collector
pub mod http;

pub use base::{BaseCollector, MetricBuilder, COLLECTOR_LABEL};
pub use fn_collector::{CollectRequest, FnCollector};
pub use http::HttpCollector;
pub use process::{ProcessCollector, PROCESS_COLLECTOR};
pub use registry::CollectorRegistry;
pub use traits::{BoxFuture, Collector, CollectorConfig, CollectorInfo, CollectorStatus};
