//! Core data types produced by collection runs
//!
//! This module defines the metric observations emitted by collectors and the
//! per-execution [`CollectionResult`] attached to scheduled jobs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ClassifiedError;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Label set attached to a metric, keyed by label name
pub type Labels = BTreeMap<String, String>;

/// One measured value produced by a collector
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricObservation {
    /// Metric name, e.g. `process_resident_memory_bytes`
    pub name: String,
    pub value: f64,
    /// Unit of the value (`bytes`, `seconds`, `count`, ...)
    pub unit: String,
    /// When the value was measured
    pub timestamp: Timestamp,
    pub labels: Labels,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MetricObservation {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Outcome of one execution of one job
///
/// A result either carries metrics or a terminal error, never both: the
/// constructors below are the only way the scheduler and collectors build
/// results, and attaching an error drops any metrics gathered so far.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionResult {
    pub collector_name: String,
    pub target: String,
    pub started_at: Timestamp,
    pub duration: Duration,
    pub metrics: Vec<MetricObservation>,
    pub error: Option<ClassifiedError>,
    pub warnings: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CollectionResult {
    /// Create an empty, successful result for `collector_name` on `target`
    pub fn new(collector_name: impl Into<String>, target: impl Into<String>, started_at: Timestamp) -> Self {
        Self {
            collector_name: collector_name.into(),
            target: target.into(),
            started_at,
            duration: Duration::ZERO,
            metrics: Vec::new(),
            error: None,
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Build a failed result, used when no collector output exists at all
    pub fn failed(
        collector_name: impl Into<String>,
        target: impl Into<String>,
        started_at: Timestamp,
        duration: Duration,
        error: ClassifiedError,
    ) -> Self {
        let mut result = Self::new(collector_name, target, started_at);
        result.duration = duration;
        result.set_error(error);
        result
    }

    /// Mark the result as failed and discard any metrics
    pub fn set_error(&mut self, error: ClassifiedError) {
        self.metrics.clear();
        self.error = Some(error);
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(name: &str) -> MetricObservation {
        MetricObservation {
            name: name.to_string(),
            value: 1.0,
            unit: "count".to_string(),
            timestamp: Utc::now(),
            labels: Labels::new(),
            description: None,
        }
    }

    #[test]
    fn test_new_result_is_success() {
        let result = CollectionResult::new("ec2", "us-east-1", Utc::now());
        assert!(result.is_success());
        assert!(result.metrics.is_empty());
        assert_eq!(result.duration, Duration::ZERO);
    }

    #[test]
    fn test_set_error_discards_metrics() {
        let mut result = CollectionResult::new("ec2", "us-east-1", Utc::now());
        result.metrics.push(observation("instances"));
        result.metrics.push(observation("volumes"));

        result.set_error(ClassifiedError::connectivity("DIAL", "refused"));

        assert!(!result.is_success());
        assert!(result.metrics.is_empty());
    }

    #[test]
    fn test_failed_result_keeps_context() {
        let err = ClassifiedError::timeout("collect", Duration::from_secs(2));
        let result = CollectionResult::failed("ec2", "eu-west-1", Utc::now(), Duration::from_secs(2), err)
            .with_metadata("attempts", 1);

        assert_eq!(result.collector_name, "ec2");
        assert_eq!(result.target, "eu-west-1");
        assert_eq!(result.duration, Duration::from_secs(2));
        assert_eq!(result.metadata["attempts"], 1);
        assert_eq!(result.error.as_ref().map(|e| e.code.as_str()), Some("TIMEOUT"));
    }

    #[test]
    fn test_observation_serialization_omits_missing_description() {
        let json = serde_json::to_value(observation("instances")).unwrap();
        assert_eq!(json["name"], "instances");
        assert!(json.get("description").is_none());
    }
}
