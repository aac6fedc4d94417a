//! Circuit breaker guarding each upstream host.
//!
//! A host that keeps failing is cut off for a cool-down period so jobs fail
//! fast instead of piling retries onto it.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[F failures]--> OPEN (rejecting) --[cool-down]--> HALF_OPEN (one probe)
//!                                                                          |
//!                                       <--[failure]--                     |
//!                                                                          |
//! CLOSED <---------------------------[success]-----------------------------+
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use super::rate_limiter::extract_domain;
use crate::plugin::SourceError;

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without being attempted.
    Open,
    /// Exactly one probe request is admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub cool_down: Duration,

    /// When the opening failure was a 429, multiply the cool-down by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum cool-down after rate limit backoffs.
    pub max_cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_cool_down: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
    last_error_message: Option<String>,
    current_cool_down: Duration,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            probe_in_flight: false,
            opened_at: None,
            last_error_message: None,
            current_cool_down: config.cool_down,
        }
    }

    fn remaining_cool_down(&self) -> Duration {
        self.opened_at.map_or(self.current_cool_down, |t| {
            self.current_cool_down.saturating_sub(t.elapsed())
        })
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Breaker name, usually the host.
    pub name: String,
    /// State at the time of the snapshot.
    pub state: CircuitState,
    /// Consecutive counted failures.
    pub failure_count: u32,
    /// Message of the most recent counted failure.
    pub last_error: Option<String>,
    /// Remaining cool-down while open.
    pub time_until_half_open: Option<Duration>,
}

/// Error type for circuit breaker admission.
#[derive(Debug, Clone, Error)]
pub enum CircuitBreakerError {
    /// Circuit is open (or its single probe is taken); the call was not attempted.
    #[error("circuit breaker '{name}' is open, retry after {}s", retry_after.as_secs())]
    Open {
        /// Breaker name.
        name: String,
        /// Time until a probe is admitted.
        retry_after: Duration,
    },
}

impl From<CircuitBreakerError> for SourceError {
    fn from(error: CircuitBreakerError) -> Self {
        match error {
            CircuitBreakerError::Open { name, retry_after } => SourceError::CircuitOpen {
                host: name,
                retry_after,
            },
        }
    }
}

/// Thread-safe circuit breaker for one upstream.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

/// Clears the half-open probe slot if the probe future is dropped before it
/// reports a result.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    active: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.active {
            self.breaker.lock_inner().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Snapshot of state and counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.remaining_cool_down());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Decides whether a call may go out. Returns true if it is the half-open probe.
    fn admit(&self) -> Result<bool, CircuitBreakerError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                tracing::debug!(circuit = %self.name, "Admitting half-open probe");
                Ok(true)
            }
            CircuitState::HalfOpen => Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::Open => Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after: inner.remaining_cool_down(),
            }),
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns [`SourceError::CircuitOpen`] immediately, `operation` is not called
    /// - HalfOpen: the first caller probes, everyone else is rejected until it reports
    ///
    /// Only errors for which [`SourceError::should_trip_circuit`] holds count as failures.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, SourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let is_probe = self.admit()?;
        let _slot = ProbeSlot {
            breaker: self,
            active: is_probe,
        };

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {}
        }

        result
    }

    /// Records a successful call; closes a half-open circuit.
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.probe_in_flight = false;
                inner.opened_at = None;
                inner.last_error_message = None;
                inner.current_cool_down = self.config.cool_down;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Counts a failure against the circuit. [`CircuitBreaker::call`] only
    /// passes errors for which [`SourceError::should_trip_circuit`] holds.
    pub fn record_failure(&self, error: &SourceError) {
        let mut inner = self.lock_inner();
        let is_rate_limit = matches!(error, SourceError::RateLimited { .. });

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_error_message = Some(error.to_string());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    if is_rate_limit {
                        self.extend_cool_down(&mut inner);
                    }
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
                inner.opened_at = Some(Instant::now());
                inner.last_error_message = Some(error.to_string());
                if is_rate_limit {
                    self.extend_cool_down(&mut inner);
                }
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    fn extend_cool_down(&self, inner: &mut CircuitBreakerInner) {
        inner.current_cool_down = std::cmp::min(
            Duration::from_secs_f32(
                inner.current_cool_down.as_secs_f32() * self.config.rate_limit_backoff_multiplier,
            ),
            self.config.max_cool_down,
        );
        tracing::info!(
            circuit = %self.name,
            cool_down_secs = inner.current_cool_down.as_secs(),
            "Extended cool-down due to rate limit"
        );
    }

    /// Forces the circuit closed and clears its counters.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new(&self.config);
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_cool_down
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}

/// One circuit breaker per upstream host, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry whose breakers share `config`.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `key`, creating it closed if needed.
    pub fn get(&self, key: &str) -> CircuitBreaker {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(key, self.config.clone()))
            .clone()
    }

    /// Returns the breaker for the host of `url`.
    pub fn for_url(&self, url: &str) -> CircuitBreaker {
        self.get(&extract_domain(url))
    }

    /// Stats for every known breaker, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> =
            self.breakers.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Resets every known breaker.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn network_error() -> SourceError {
        SourceError::transient("https://img.test/1.jpg", "connection reset")
    }

    fn breaker(failure_threshold: u32, cool_down: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "img.test",
            CircuitBreakerConfig {
                failure_threshold,
                cool_down,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_failures() {
        let cb = breaker(3, Duration::from_secs(30));
        for _ in 0..2 {
            cb.record_failure(&network_error());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(5, Duration::from_secs(30));
        for _ in 0..4 {
            cb.record_failure(&network_error());
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure(&network_error());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_fast_without_invoking() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure(&network_error());

        let calls = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SourceError>(())
            })
            .await;

        assert!(matches!(result, Err(SourceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let cb = breaker(1, Duration::from_secs(10));
        cb.record_failure(&network_error());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.admit().unwrap());
        assert!(cb.admit().is_err());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.admit().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_and_restarts_timer() {
        let cb = breaker(1, Duration::from_secs(10));
        cb.record_failure(&network_error());
        tokio::time::advance(Duration::from_secs(10)).await;

        let result = cb.call(|| async { Err::<(), _>(network_error()) }).await;
        assert!(matches!(result, Err(SourceError::Transient { .. })));
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let cb = breaker(1, Duration::from_secs(1));
        cb.record_failure(&network_error());
        tokio::time::advance(Duration::from_secs(1)).await;

        let probe = cb.call(|| std::future::pending::<Result<(), SourceError>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), probe).await;

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.admit().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_content_does_not_trip() {
        let cb = breaker(1, Duration::from_secs(60));
        let result = cb
            .call(|| async { Err::<(), _>(SourceError::rejected("u", "404")) })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_extends_cool_down() {
        let cb = breaker(1, Duration::from_secs(30));
        cb.record_failure(&SourceError::RateLimited {
            url: "u".into(),
            retry_after: None,
        });

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.time_until_half_open, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset() {
        let cb = breaker(1, Duration::from_secs(300));
        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.stats().last_error.is_none());
    }

    // ==================== Registry Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_registry_keys_by_host() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry
            .for_url("https://a.test/1.jpg")
            .record_failure(&network_error());

        assert_eq!(registry.for_url("https://A.test/2.jpg").state(), CircuitState::Open);
        assert_eq!(registry.for_url("https://b.test/1.jpg").state(), CircuitState::Closed);

        let names: Vec<String> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a.test".to_string(), "b.test".to_string()]);

        registry.reset_all();
        assert_eq!(registry.get("a.test").state(), CircuitState::Closed);
    }
}
