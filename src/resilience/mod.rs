/// Retry configuration, policies and backoff computation
pub mod retry;

/// Circuit breaker state machine and breaker-aware retry policy
pub mod circuit_breaker;

/// Resilient executor running units of work with retries
pub mod executor;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerStatus, CircuitState,
};
pub use executor::{BoxError, Execution, ResilientExecutor};
pub use retry::{backoff_delay, DefaultRetryPolicy, RetryConfig, RetryPolicy};
