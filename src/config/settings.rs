use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::collectors::{CollectorConfig, PROCESS_COLLECTOR};
use crate::error::ConfigError;
use crate::events::Labels;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::scheduler::SchedulerConfig;

/// Agent configuration, read from a TOML file
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// ```
/// use harvester::config::AppConfig;
///
/// let config: AppConfig = r#"
///     [scheduler]
///     tick_interval_ms = 500
///
///     [collectors.http]
///     interval_secs = 30
///     targets = ["https://example.com/health"]
/// "#
/// .parse()
/// .unwrap();
///
/// assert_eq!(config.scheduler.tick_interval_ms, 500);
/// assert!(config.collectors.contains_key("http"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub health: HealthSettings,
    /// Collector sections keyed by collector name
    pub collectors: BTreeMap<String, CollectorSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub name: String,
    /// Allow-list of targets; empty allows every target
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval_ms: u64,
    pub max_concurrent_jobs: usize,
    pub job_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub retries: u32,
    pub base_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub check_timeout_secs: u64,
    /// HTTP endpoints probed by the connectivity check
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub targets: Vec<String>,
    /// Extra labels added to every metric of this collector
    pub labels: Labels,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut collectors = BTreeMap::new();
        collectors.insert(
            PROCESS_COLLECTOR.to_string(),
            CollectorSettings {
                interval_secs: 60,
                targets: vec!["self".to_string()],
                ..CollectorSettings::default()
            },
        );

        Self {
            service: ServiceSettings::default(),
            scheduler: SchedulerSettings::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            health: HealthSettings::default(),
            collectors,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: crate::SERVICE_NAME.to_string(),
            targets: Vec::new(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 30_000,
            max_concurrent_jobs: 10,
            job_timeout_secs: 300,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay_ms: 1_000,
            min_delay_ms: 100,
            max_delay_ms: 30_000,
            attempt_timeout_secs: 30,
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            success_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            check_timeout_secs: 10,
            endpoints: Vec::new(),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            targets: Vec::new(),
            labels: Labels::new(),
        }
    }
}

impl FromStr for AppConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(content)?)
    }
}

impl AppConfig {
    /// Read and parse a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read and a TOML
    /// error if it does not parse.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        content.parse()
    }

    /// Load the configuration, falling back to defaults when there is no file
    ///
    /// A missing file only logs a warning; a file that exists but is invalid
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            info!("No configuration file given, using defaults");
            return Ok(Self::default());
        };

        if !path.exists() {
            warn!("Configuration file '{}' not found, using defaults", path.display());
            return Ok(Self::default());
        }

        info!("Loading configuration from: {}", path.display());
        Self::from_file(path)
    }

    /// Reject values the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.scheduler.tick_interval_ms == 0 {
            errors.push("scheduler.tick_interval_ms must be positive".to_string());
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            errors.push("scheduler.max_concurrent_jobs must be positive".to_string());
        }
        if self.scheduler.job_timeout_secs == 0 {
            errors.push("scheduler.job_timeout_secs must be positive".to_string());
        }
        if self.retry.attempt_timeout_secs == 0 {
            errors.push("retry.attempt_timeout_secs must be positive".to_string());
        }
        if self.retry.max_delay_ms < self.retry.min_delay_ms {
            errors.push("retry.max_delay_ms must not be below retry.min_delay_ms".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            errors.push("circuit_breaker thresholds must be positive".to_string());
        }
        if self.health.interval_secs == 0 || self.health.check_timeout_secs == 0 {
            errors.push("health.interval_secs and health.check_timeout_secs must be positive".to_string());
        }
        for (name, collector) in &self.collectors {
            if collector.interval_secs == 0 {
                errors.push(format!("collectors.{}.interval_secs must be positive", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(errors.join("; ")))
        }
    }

    /// Problems that do not stop the agent but make it less useful
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.service.name.trim().is_empty() {
            issues.push("service name not configured".to_string());
        }

        let enabled: Vec<(&String, &CollectorSettings)> = self.enabled_collectors().collect();
        if enabled.is_empty() {
            issues.push("no collectors enabled".to_string());
        }
        for (name, collector) in enabled {
            let allowed = collector
                .targets
                .iter()
                .filter(|t| self.service.targets.is_empty() || self.service.targets.contains(*t))
                .count();
            if allowed == 0 {
                issues.push(format!("collector {} has no enabled targets", name));
            }
        }

        issues
    }

    /// Collector sections with `enabled = true`
    pub fn enabled_collectors(&self) -> impl Iterator<Item = (&String, &CollectorSettings)> {
        self.collectors.iter().filter(|(_, collector)| collector.enabled)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.scheduler.tick_interval_ms),
            max_concurrent_jobs: self.scheduler.max_concurrent_jobs,
            job_timeout: Duration::from_secs(self.scheduler.job_timeout_secs),
            enabled_targets: self.service.targets.clone(),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            retries: self.retry.retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            min_delay: Duration::from_millis(self.retry.min_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            attempt_timeout: Duration::from_secs(self.retry.attempt_timeout_secs),
        }
    }

    /// Breaker settings, or `None` when breakers are disabled
    pub fn circuit_breaker_config(&self) -> Option<CircuitBreakerConfig> {
        self.circuit_breaker.enabled.then(|| CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            success_threshold: self.circuit_breaker.success_threshold,
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_secs),
        })
    }

    /// Typed configuration of the named collector section
    pub fn collector_config(&self, name: &str) -> Option<CollectorConfig> {
        let collector = self.collectors.get(name)?;
        Some(CollectorConfig {
            enabled: collector.enabled,
            interval: Duration::from_secs(collector.interval_secs),
            targets: collector.targets.clone(),
            retry: self.retry_config(),
            service: self.service.name.clone(),
            custom_labels: collector.labels.clone(),
        })
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.health.check_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
        [service]
        name = "edge-agent"
        targets = ["us-east-1", "eu-west-1"]

        [scheduler]
        tick_interval_ms = 250
        max_concurrent_jobs = 4
        job_timeout_secs = 20

        [retry]
        retries = 2
        base_delay_ms = 50

        [circuit_breaker]
        enabled = true
        failure_threshold = 3

        [collectors.http]
        interval_secs = 15
        targets = ["us-east-1"]
        labels = { team = "infra" }

        [collectors.process]
        enabled = false
    "#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.scheduler_config(), SchedulerConfig::default());
        assert_eq!(config.retry_config(), RetryConfig::default());
        assert!(config.circuit_breaker_config().is_none());
        assert!(config.validate().is_ok());
        assert!(config.issues().is_empty());
    }

    #[test]
    fn test_sections_convert_to_typed_configs() {
        let config: AppConfig = SAMPLE.parse().unwrap();

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.tick_interval, Duration::from_millis(250));
        assert_eq!(scheduler.max_concurrent_jobs, 4);
        assert_eq!(scheduler.job_timeout, Duration::from_secs(20));
        assert_eq!(scheduler.enabled_targets, vec!["us-east-1", "eu-west-1"]);

        let retry = config.retry_config();
        assert_eq!(retry.retries, 2);
        assert_eq!(retry.base_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, Duration::from_secs(30));

        let breaker = config.circuit_breaker_config().unwrap();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.success_threshold, 3);

        let http = config.collector_config("http").unwrap();
        assert_eq!(http.interval, Duration::from_secs(15));
        assert_eq!(http.service, "edge-agent");
        assert_eq!(http.custom_labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(http.retry, retry);

        let enabled: Vec<&String> = config.enabled_collectors().map(|(name, _)| name).collect();
        assert_eq!(enabled, vec!["http"]);
        assert!(config.collector_config("missing").is_none());
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = AppConfig::default();
        config.scheduler.tick_interval_ms = 0;
        config.retry.min_delay_ms = 500;
        config.retry.max_delay_ms = 100;
        config.collectors.get_mut("process").unwrap().interval_secs = 0;

        match config.validate() {
            Err(ConfigError::ValidationError(message)) => {
                assert!(message.contains("tick_interval_ms"));
                assert!(message.contains("max_delay_ms"));
                assert!(message.contains("collectors.process.interval_secs"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_issues_report_unusable_collectors() {
        let mut config: AppConfig = SAMPLE.parse().unwrap();
        assert!(config.issues().is_empty());

        config.collectors.get_mut("http").unwrap().targets = vec!["ap-south-1".to_string()];
        config.service.name = String::new();
        assert_eq!(
            config.issues(),
            vec!["service name not configured", "collector http has no enabled targets"]
        );

        config.collectors.get_mut("http").unwrap().enabled = false;
        assert!(config.issues().contains(&"no collectors enabled".to_string()));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.service.name, "edge-agent");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();

        assert_eq!(config, AppConfig::default());
        assert_eq!(AppConfig::load(None).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[scheduler]\ntick_interval_ms = \"soon\"\n").unwrap();

        assert!(matches!(
            AppConfig::load(Some(file.path())),
            Err(ConfigError::TomlError(_))
        ));
    }
}
