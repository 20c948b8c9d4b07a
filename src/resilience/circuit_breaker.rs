use log::{info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::error::ClassifiedError;

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing dependency, all work is refused
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker
    pub success_threshold: u32,
    /// Time since the last failure before an open breaker half-opens
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
}

/// Point-in-time view of a breaker, for status reporting
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Consecutive-failure circuit breaker
///
/// Safe to share between jobs: all counters live behind one mutex. The
/// open to half-open transition happens lazily the first time the breaker is
/// consulted after the cooldown, there is no background timer.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the cooldown transition if it is due
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, now);
        inner.state
    }

    /// Whether the breaker currently refuses work
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    /// Check the breaker at a specific instant
    ///
    /// This is primarily used for testing with controlled time.
    pub fn is_open_at(&self, now: Instant) -> bool {
        self.state_at(now) == CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    info!("Circuit breaker '{}' closed after recovery", self.name);
                    inner.state = CircuitState::Closed;
                    inner.consecutive_successes = 0;
                }
            }
            // A call admitted before the breaker opened came back healthy
            CircuitState::Open => {
                info!("Circuit breaker '{}' closed by a successful call", self.name);
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Record a failure at a specific instant
    ///
    /// This is primarily used for testing with controlled time.
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker '{}' reopened by a half-open failure", self.name);
                inner.state = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, Instant::now());
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
        }
    }

    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }

        let cooled_down = inner
            .last_failure
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.cooldown);
        if cooled_down {
            info!("Circuit breaker '{}' half-open, probing dependency", self.name);
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
        }
    }
}

/// Retry policy that consults a circuit breaker before the default rules
///
/// The breaker is shared through an `Arc`, so several collectors talking to
/// the same dependency can trip it together.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    inner: DefaultRetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerPolicy {
    pub fn new(inner: DefaultRetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl RetryPolicy for CircuitBreakerPolicy {
    fn should_retry(&self, err: &ClassifiedError, attempt: u32) -> bool {
        if self.breaker.is_open() {
            return false;
        }
        self.inner.should_retry(err, attempt)
    }

    fn retry_delay(&self, err: &ClassifiedError, attempt: u32) -> Duration {
        self.inner.retry_delay(err, attempt)
    }

    fn permits_attempt(&self) -> bool {
        !self.breaker.is_open()
    }

    fn record_success(&self) {
        self.breaker.record_success();
    }

    fn record_failure(&self, _err: &ClassifiedError) {
        self.breaker.record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryConfig;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("ec2", CircuitBreakerConfig::default())
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let breaker = breaker();
        let now = Instant::now();

        for _ in 0..4 {
            breaker.record_failure_at(now);
        }
        assert!(!breaker.is_open_at(now));

        breaker.record_failure_at(now);
        assert!(breaker.is_open_at(now));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = breaker();
        let now = Instant::now();

        for _ in 0..4 {
            breaker.record_failure_at(now);
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure_at(now);
        }

        assert_eq!(breaker.state_at(now), CircuitState::Closed);
    }

    #[test]
    fn test_half_opens_lazily_after_cooldown() {
        let breaker = breaker();
        let opened_at = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(opened_at);
        }

        assert!(breaker.is_open_at(opened_at + Duration::from_secs(59)));
        assert!(!breaker.is_open_at(opened_at + Duration::from_secs(60)));
        assert_eq!(breaker.state_at(opened_at + Duration::from_secs(61)), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let breaker = breaker();
        let opened_at = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(opened_at);
        }
        let later = opened_at + Duration::from_secs(61);
        assert_eq!(breaker.state_at(later), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state_at(later), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state_at(later), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker();
        let opened_at = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(opened_at);
        }
        let later = opened_at + Duration::from_secs(61);
        assert_eq!(breaker.state_at(later), CircuitState::HalfOpen);

        breaker.record_failure_at(later);
        assert!(breaker.is_open_at(later + Duration::from_secs(1)));
        // The cooldown restarts from the half-open failure
        assert!(!breaker.is_open_at(later + Duration::from_secs(60)));
    }

    #[test]
    fn test_policy_denies_retries_while_open() {
        let shared = Arc::new(breaker());
        let policy = CircuitBreakerPolicy::new(
            DefaultRetryPolicy::new(RetryConfig::default()),
            Arc::clone(&shared),
        );
        let err = ClassifiedError::connectivity("DIAL", "refused");

        assert!(policy.should_retry(&err, 0));
        assert!(policy.permits_attempt());

        for _ in 0..5 {
            policy.record_failure(&err);
        }

        assert!(!policy.should_retry(&err, 0));
        assert!(!policy.permits_attempt());
        assert_eq!(shared.status().state, CircuitState::Open);
        assert_eq!(shared.status().consecutive_failures, 5);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"half_open\"");
        assert_eq!(serde_json::to_string(&CircuitState::Closed).unwrap(), "\"closed\"");
    }
}
