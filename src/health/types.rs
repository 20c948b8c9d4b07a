use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::events::Timestamp;

/// Outcome of a health check, and of the system as a whole
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Result of one run of one health check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub last_checked: Timestamp,
    pub duration: Duration,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            last_checked: Utc::now(),
            duration: Duration::ZERO,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy, message)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded, message)
    }

    /// An unhealthy result; `error` doubles as the message
    pub fn unhealthy(name: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(name, HealthStatus::Unhealthy, error.clone()).with_error(error)
    }

    pub fn unknown(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unknown, message)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Snapshot of the aggregated health of the service
#[derive(Debug, Clone, Serialize)]
pub struct OverallHealth {
    pub status: HealthStatus,
    pub timestamp: Timestamp,
    pub uptime: Duration,
    pub version: String,
    pub service: String,
    pub checks: BTreeMap<String, CheckResult>,
    pub summary: String,
}
