/// TOML configuration of the agent
pub mod settings;

pub use settings::{
    AppConfig, CircuitBreakerSettings, CollectorSettings, HealthSettings, RetrySettings, SchedulerSettings,
    ServiceSettings,
};
