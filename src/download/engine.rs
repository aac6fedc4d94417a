//! Guarded upstream calls: rate limiting, circuit breaking and retry.
//!
//! [`UpstreamGuard`] wraps every call a job makes to an upstream, whether a
//! parser resolve or a page fetch. Each attempt independently takes a rate
//! limiter token and passes through the host's circuit breaker; failures are
//! classified and retried with exponential backoff.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chapterdl_core::download::{
//!     CircuitBreakerConfig, CircuitBreakerRegistry, RateLimiter, RateLimiterConfig,
//!     RetryPolicy, UpstreamGuard,
//! };
//! use chapterdl_core::plugin::SourceError;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let guard = UpstreamGuard::new(
//!     Arc::new(RateLimiter::new(RateLimiterConfig::default())),
//!     Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
//!     RetryPolicy::default(),
//!     std::time::Duration::from_secs(30),
//! );
//! let cancel = CancellationToken::new();
//!
//! let body = guard
//!     .call("https://example.com/001.jpg", &cancel, || async {
//!         Ok::<_, SourceError>("page")
//!     })
//!     .await;
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::circuit_breaker::CircuitBreakerRegistry;
use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::plugin::SourceError;

/// Why a guarded call gave up.
#[derive(Debug, Error)]
pub enum CallError {
    /// Cancellation was observed while waiting; no further attempt was made.
    #[error("cancelled")]
    Cancelled,

    /// The last attempt failed and the retry policy gave up.
    #[error("{error} (after {attempts} attempts)")]
    Failed {
        /// Error of the final attempt.
        #[source]
        error: SourceError,
        /// Number of attempts made.
        attempts: u32,
    },
}

/// Counters for guarded upstream calls.
///
/// Uses atomic counters for thread-safe updates from concurrent fetch tasks.
#[derive(Debug, Default)]
pub struct CallStats {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl CallStats {
    /// Returns the number of calls that eventually succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Returns the number of calls that failed after all attempts.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the number of retry attempts made.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }
}

/// Shared gatekeeper for upstream calls.
#[derive(Debug, Clone)]
pub struct UpstreamGuard {
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry_policy: RetryPolicy,
    acquire_timeout: Duration,
    stats: Arc<CallStats>,
}

impl UpstreamGuard {
    /// Creates a guard.
    ///
    /// # Arguments
    ///
    /// * `rate_limiter` - Token bucket consulted before every attempt
    /// * `breakers` - Per-host circuit breakers
    /// * `retry_policy` - Backoff and attempt budget
    /// * `acquire_timeout` - Longest wait for a rate limiter token
    #[must_use]
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry_policy: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        debug!(
            max_attempts = retry_policy.max_attempts(),
            rate_limit_disabled = rate_limiter.is_disabled(),
            acquire_timeout_ms = acquire_timeout.as_millis(),
            "creating upstream guard"
        );
        Self {
            rate_limiter,
            breakers,
            retry_policy,
            acquire_timeout,
            stats: Arc::new(CallStats::default()),
        }
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns the per-host circuit breakers.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Returns call counters.
    #[must_use]
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Runs `operation` against the upstream of `url` until it succeeds, fails
    /// permanently, or exhausts the retry budget.
    ///
    /// Cancellation is observed while waiting for a rate limiter token and
    /// during backoff, never while `operation` itself is running.
    ///
    /// # Errors
    ///
    /// - [`CallError::Cancelled`] if `cancel` fires while waiting
    /// - [`CallError::Failed`] with the last error once retrying stops
    #[instrument(skip(self, cancel, operation), fields(host))]
    pub async fn call<T, F, Fut>(
        &self,
        url: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let breaker = self.breakers.for_url(url);
        tracing::Span::current().record("host", breaker.name());
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attempt, "attempting upstream call");

            let acquired = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CallError::Cancelled),
                acquired = self.rate_limiter.acquire(1, self.acquire_timeout) => acquired,
            };

            let result = match acquired {
                Ok(()) => breaker.call(&mut operation).await,
                Err(e) => Err(SourceError::from(e)),
            };

            let error = match result {
                Ok(value) => {
                    self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            let hinted_delay = match &error {
                SourceError::RateLimited { retry_after, .. } => *retry_after,
                SourceError::CircuitOpen { retry_after, .. } => Some(*retry_after),
                _ => None,
            };

            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay: backoff_delay,
                    attempt: next_attempt,
                } => {
                    let delay = match (&error, hinted_delay) {
                        // Retry-After overrides the backoff outright
                        (SourceError::RateLimited { .. }, Some(hint)) => hint,
                        // no point probing before the cool-down ends
                        (SourceError::CircuitOpen { .. }, Some(hint)) => backoff_delay.max(hint),
                        _ => backoff_delay,
                    };

                    info!(
                        url,
                        attempt = next_attempt,
                        max_attempts = self.retry_policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = hinted_delay.is_some(),
                        error = %error,
                        "retrying upstream call"
                    );
                    self.stats.retried.fetch_add(1, Ordering::SeqCst);

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(CallError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, %reason, "not retrying upstream call");
                    self.stats.failed.fetch_add(1, Ordering::SeqCst);
                    return Err(CallError::Failed {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tokio::time::Instant;

    use super::*;
    use crate::download::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::download::rate_limiter::RateLimiterConfig;

    fn guard(max_attempts: u32, failure_threshold: u32) -> UpstreamGuard {
        UpstreamGuard::new(
            Arc::new(RateLimiter::disabled()),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold,
                cool_down: Duration::from_secs(60),
                ..Default::default()
            })),
            RetryPolicy::new(
                max_attempts,
                Duration::from_secs(1),
                Duration::from_secs(30),
                2.0,
            )
            .with_jitter(Duration::ZERO),
            Duration::from_secs(5),
        )
    }

    const URL: &str = "https://img.test/001.jpg";

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let guard = guard(3, 10);
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = guard
            .call(URL, &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SourceError::transient(URL, "reset"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(guard.stats().retried(), 1);
        assert_eq!(guard.stats().succeeded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_is_not_retried() {
        let guard = guard(5, 10);
        let calls = AtomicU32::new(0);

        let err = guard
            .call(URL, &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SourceError::rejected(URL, "404"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Failed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let guard = guard(3, 10);
        let calls = AtomicU32::new(0);

        let err = guard
            .call(URL, &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SourceError::transient(URL, "reset"))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CallError::Failed { attempts: 3, error: SourceError::Transient { .. } }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(guard.stats().failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let guard = guard(2, 10);
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        guard
            .call(URL, &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SourceError::RateLimited {
                        url: URL.into(),
                        retry_after: Some(Duration::from_secs(7)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let guard = guard(1, 1);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(SourceError::transient(URL, "reset"))
        };

        let first = guard.call(URL, &cancel, failing).await.unwrap_err();
        assert!(matches!(first, CallError::Failed { error: SourceError::Transient { .. }, .. }));
        assert_eq!(guard.breakers().for_url(URL).state(), CircuitState::Open);

        let second = guard.call(URL, &cancel, failing).await.unwrap_err();
        assert!(matches!(
            second,
            CallError::Failed { error: SourceError::CircuitOpen { .. }, attempts: 1 }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_waits_for_cool_down_then_probes() {
        let guard = guard(2, 1);
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        guard
            .call(URL, &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SourceError::transient(URL, "reset"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(guard.breakers().for_url(URL).state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let guard = guard(5, 10);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let err = guard
            .call(URL, &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SourceError::transient(URL, "reset"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_timeout_is_retried() {
        let guard = UpstreamGuard::new(
            Arc::new(RateLimiter::new(RateLimiterConfig {
                capacity: 1,
                refill_per_sec: 0.1,
            })),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(1), 2.0)
                .with_jitter(Duration::ZERO),
            Duration::from_millis(100),
        );
        let cancel = CancellationToken::new();

        guard.call(URL, &cancel, || async { Ok::<_, SourceError>(()) }).await.unwrap();
        let err = guard
            .call(URL, &cancel, || async { Ok::<_, SourceError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Failed { error: SourceError::RateLimitTimeout { .. }, attempts: 2 }
        ));
    }
}
