//! Error types for the collection agent
//!
//! [`ClassifiedError`] is the error model shared by every component of the
//! orchestration core. It carries a category, a short code, a severity and an
//! optional retryability override, plus structured context about where the
//! failure happened. Component-level failures that never travel through the
//! retry machinery use plain `thiserror` enums.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::events::Timestamp;

/// Category of a classified error
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A call to an external dependency (API, service) failed
    DependencyCall,
    /// Invalid or missing configuration
    Configuration,
    /// Network level failure reaching a dependency
    Connectivity,
    /// Input or state validation failure
    Validation,
    /// An operation exceeded its deadline
    Timeout,
    /// Credentials or authorization problem
    Permission,
    /// The dependency asked us to slow down
    RateLimit,
    /// Failure inside the agent itself
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DependencyCall => "dependency_call",
            Self::Configuration => "configuration",
            Self::Connectivity => "connectivity",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Permission => "permission",
            Self::RateLimit => "rate_limit",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Severity of a classified error, used only to pick a log level
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Log level matching this severity
    pub fn log_level(self) -> log::Level {
        match self {
            Self::Low => log::Level::Debug,
            Self::Medium => log::Level::Info,
            Self::High => log::Level::Warn,
            Self::Critical => log::Level::Error,
        }
    }
}

/// Error codes and message fragments of dependency failures known to be transient
const TRANSIENT_DEPENDENCY_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestTimeout",
    "RequestTimeoutException",
    "PriorRequestNotComplete",
    "ConnectionError",
    "NetworkError",
    "DNSError",
    "TimeoutError",
    "RequestExpired",
    "ServiceTemporarilyUnavailable",
];

/// Lowercase message patterns of transient dependency failures
const TRANSIENT_DEPENDENCY_PATTERNS: &[&str] = &[
    "connection reset",
    "connection timeout",
    "connection refused",
    "no such host",
    "network is unreachable",
    "temporary failure",
    "service temporarily unavailable",
    "internal server error",
    "bad gateway",
    "gateway timeout",
];

/// Internal error codes that may succeed on a later attempt
const RETRYABLE_INTERNAL_CODES: &[&str] = &[
    "CONTEXT_CANCELLED",
    "TIMEOUT",
    "NETWORK_ERROR",
    "TEMPORARY_FAILURE",
];

/// An error tagged with a category, code and severity
///
/// Two classified errors are equal when their category and code match;
/// message and context do not take part in the comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: Timestamp,
    /// Explicit retryability; `None` falls back to the category default
    pub retryable: Option<bool>,
    /// Suggested delay before the next attempt (rate limits)
    pub retry_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ClassifiedError {
    /// Create a new error with medium severity and category-default retryability
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            severity: Severity::Medium,
            timestamp: Utc::now(),
            retryable: None,
            retry_after: None,
            operation: None,
            target: None,
            service: None,
            metadata: BTreeMap::new(),
            cause: None,
        }
    }

    /// Failure of a call to an external dependency
    pub fn dependency(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::DependencyCall, code, message)
    }

    pub fn configuration(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, code, message).with_severity(Severity::Critical)
    }

    pub fn connectivity(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connectivity, code, message).with_retryable(true)
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    /// An operation that did not finish within `after`
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            "TIMEOUT",
            format!("operation timed out after {:?}", after),
        )
        .with_operation(operation)
        .with_retryable(true)
    }

    /// The dependency throttled us and asked to wait `retry_after`
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::new(ErrorCategory::RateLimit, "RATE_LIMIT", "rate limit exceeded")
            .with_retryable(true)
            .with_retry_after(retry_after)
    }

    pub fn permission(operation: impl Into<String>, resource: &str) -> Self {
        Self::new(
            ErrorCategory::Permission,
            "ACCESS_DENIED",
            format!("insufficient permissions for resource: {}", resource),
        )
        .with_operation(operation)
        .with_severity(Severity::High)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    /// The surrounding execution was cancelled
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::internal("CONTEXT_CANCELLED", message).with_severity(Severity::Low)
    }

    /// A circuit breaker refused to let the work run
    pub fn circuit_open(name: &str) -> Self {
        Self::internal("CIRCUIT_OPEN", format!("circuit breaker '{}' is open", name))
            .with_retryable(false)
            .with_severity(Severity::High)
    }

    /// Wrap an error with additional context
    ///
    /// A `ClassifiedError` keeps its identity and gets `message` prepended;
    /// any other error becomes the cause of a new classified error.
    pub fn wrap<E>(err: E, category: ErrorCategory, code: &str, message: &str) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        match boxed.downcast::<ClassifiedError>() {
            Ok(existing) => {
                let mut enhanced = *existing;
                if !message.is_empty() {
                    enhanced.message = format!("{}: {}", message, enhanced.message);
                }
                enhanced
            }
            Err(other) => Self {
                cause: Some(Arc::from(other)),
                ..Self::new(category, code, message)
            },
        }
    }

    /// Classify an arbitrary error
    ///
    /// Classified errors are recovered as-is, anything else becomes an
    /// `internal` error carrying the original as its cause.
    pub fn from_error(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        match err.downcast::<ClassifiedError>() {
            Ok(classified) => *classified,
            Err(other) => {
                let message = format!("collection failed: {}", other);
                Self {
                    cause: Some(Arc::from(other)),
                    ..Self::internal("COLLECTION_ERROR", message)
                }
            }
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Whether this error has the given category and code
    pub fn is(&self, category: ErrorCategory, code: &str) -> bool {
        self.category == category && self.code == code
    }

    /// Whether a later attempt could succeed
    ///
    /// An explicit flag always wins. Otherwise connectivity, timeout and
    /// rate-limit errors are retryable, dependency-call errors are retryable
    /// when they match a known transient signature, internal errors only for
    /// a short list of codes, and everything else is not.
    pub fn is_retryable(&self) -> bool {
        if let Some(explicit) = self.retryable {
            return explicit;
        }

        match self.category {
            ErrorCategory::Connectivity | ErrorCategory::Timeout | ErrorCategory::RateLimit => true,
            ErrorCategory::DependencyCall => self.matches_transient_signature(),
            ErrorCategory::Internal => RETRYABLE_INTERNAL_CODES.contains(&self.code.as_str()),
            ErrorCategory::Permission
            | ErrorCategory::Configuration
            | ErrorCategory::Validation => false,
        }
    }

    fn matches_transient_signature(&self) -> bool {
        let known_code = TRANSIENT_DEPENDENCY_CODES
            .iter()
            .any(|code| self.code.contains(code) || self.message.contains(code));
        if known_code {
            return true;
        }

        let message = self.message.to_lowercase();
        TRANSIENT_DEPENDENCY_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(operation) = &self.operation {
            parts.push(format!("operation={}", operation));
        }
        if let Some(service) = &self.service {
            parts.push(format!("service={}", service));
        }
        if let Some(target) = &self.target {
            parts.push(format!("target={}", target));
        }
        if !self.code.is_empty() {
            parts.push(format!("code={}", self.code));
        }

        if parts.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", parts.join(", "), self.message)
        }
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl PartialEq for ClassifiedError {
    fn eq(&self, other: &Self) -> bool {
        self.is(other.category, &other.code)
    }
}

impl Eq for ClassifiedError {}

/// Errors that can occur while managing the collector registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Collector name cannot be empty")]
    EmptyName,

    #[error("Collector already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Collector not found: {0}")]
    NotFound(String),

    #[error("Failed to start {} collector(s): {}", .0.len(), join_failures(.0))]
    StartFailed(Vec<(String, ClassifiedError)>),

    #[error("Failed to stop {} collector(s): {}", .0.len(), join_failures(.0))]
    StopFailed(Vec<(String, ClassifiedError)>),
}

fn join_failures(failures: &[(String, ClassifiedError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors reported by job result/error processors
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Job processor failed: {0}")]
    Failed(String),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
