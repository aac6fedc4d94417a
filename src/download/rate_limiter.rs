//! Token-bucket rate limiting for upstream requests.
//!
//! This module provides the [`RateLimiter`] struct which bounds how fast
//! requests are issued to an upstream class. Every parser resolve and every
//! page fetch attempt takes one token before it goes out.
//!
//! # Overview
//!
//! The bucket holds up to `capacity` tokens and refills continuously at
//! `refill_per_sec`. Refill is computed lazily from elapsed monotonic time on
//! each call, so an idle limiter costs nothing. Waiting happens outside the
//! limiter's lock.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chapterdl_core::download::{RateLimiter, RateLimiterConfig};
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(RateLimiterConfig {
//!     capacity: 4,
//!     refill_per_sec: 2.0,
//! });
//!
//! // Burst of four succeeds immediately
//! for _ in 0..4 {
//!     assert!(limiter.try_acquire(1));
//! }
//!
//! // Fifth waits ~500ms for a refill
//! limiter.acquire(1, Duration::from_secs(2)).await.unwrap();
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::plugin::SourceError;

/// Warning threshold for cumulative wait time (30 seconds).
const CUMULATIVE_WAIT_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Absorbs float error when a refill lands exactly on a whole token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Default burst capacity.
pub const DEFAULT_CAPACITY: u32 = 8;

/// Default refill rate (tokens per second).
pub const DEFAULT_REFILL_PER_SEC: f64 = 4.0;

/// Slowest refill rate a configuration may ask for (one token per ~17 minutes).
pub const MIN_REFILL_PER_SEC: f64 = 0.001;

/// Token bucket settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum tokens (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
        }
    }
}

/// Errors returned by [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Tokens did not become available before the deadline.
    #[error("rate limiter timed out after {}ms", waited.as_millis())]
    Timeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The request can never be satisfied by this bucket.
    #[error("requested {requested} tokens but capacity is {capacity}")]
    ExceedsCapacity {
        /// Tokens requested.
        requested: u32,
        /// Bucket capacity.
        capacity: u32,
    },
}

impl From<RateLimitError> for SourceError {
    fn from(error: RateLimitError) -> Self {
        match error {
            RateLimitError::Timeout { waited } => SourceError::RateLimitTimeout { waited },
            RateLimitError::ExceedsCapacity { .. } => SourceError::RateLimitTimeout {
                waited: Duration::ZERO,
            },
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter shared by every job.
///
/// `RateLimiter` is `Send + Sync`; wrap it in `Arc` and share it across
/// spawned Tokio tasks. Timing uses `tokio::time::Instant`, so tests can run
/// it under a paused clock.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,

    /// Whether rate limiting is disabled (for `--rate-limit 0`).
    disabled: bool,

    bucket: Mutex<Bucket>,

    /// Total time callers spent waiting (in milliseconds).
    /// Used to warn when excessive rate limiting occurs.
    cumulative_wait_ms: AtomicU64,
}

impl RateLimiter {
    /// Creates a full bucket with the given settings.
    #[must_use]
    #[instrument(skip_all, fields(capacity = config.capacity, refill_per_sec = config.refill_per_sec))]
    pub fn new(config: RateLimiterConfig) -> Self {
        debug!("creating rate limiter");
        Self {
            config,
            disabled: false,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            }),
            cumulative_wait_ms: AtomicU64::new(0),
        }
    }

    /// Creates a disabled rate limiter that always grants immediately.
    #[must_use]
    #[instrument]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            config: RateLimiterConfig {
                capacity: 0,
                refill_per_sec: 0.0,
            },
            disabled: true,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
            cumulative_wait_ms: AtomicU64::new(0),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the bucket settings.
    #[must_use]
    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    fn lock_bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let added = elapsed.as_secs_f64() * self.config.refill_per_sec;
        bucket.tokens = (bucket.tokens + added).min(f64::from(self.config.capacity));
        bucket.last_refill = now;
    }

    /// Tokens currently in the bucket, after refill.
    ///
    /// A disabled limiter reports `f64::INFINITY`.
    #[must_use]
    pub fn available(&self) -> f64 {
        if self.disabled {
            return f64::INFINITY;
        }
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Takes `n` tokens if they are available right now.
    ///
    /// Never blocks. Returns `false` when the bucket is short or when
    /// `n` exceeds the capacity.
    #[must_use]
    pub fn try_acquire(&self, n: u32) -> bool {
        if self.disabled {
            return true;
        }
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        take(&mut bucket, n)
    }

    /// Takes `n` tokens, waiting up to `timeout` for them to refill.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::ExceedsCapacity`] immediately when `n` is larger than the bucket
    /// - [`RateLimitError::Timeout`] when the tokens cannot arrive before `timeout` elapses
    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis()))]
    pub async fn acquire(&self, n: u32, timeout: Duration) -> Result<(), RateLimitError> {
        if self.disabled {
            return Ok(());
        }
        if n > self.config.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity: self.config.capacity,
            });
        }

        let start = Instant::now();
        let deadline = start.checked_add(timeout);

        loop {
            let wait = {
                let mut bucket = self.lock_bucket();
                self.refill(&mut bucket);
                if take(&mut bucket, n) {
                    let waited = start.elapsed();
                    if !waited.is_zero() {
                        self.record_wait(waited);
                    }
                    return Ok(());
                }
                if self.config.refill_per_sec <= 0.0 {
                    None
                } else {
                    let missing = f64::from(n) - bucket.tokens;
                    // Unrepresentable waits are treated as never.
                    Duration::try_from_secs_f64(missing / self.config.refill_per_sec)
                        .ok()
                        .map(|wait| wait.max(Duration::from_millis(1)))
                }
            };

            let now = Instant::now();
            match wait {
                Some(wait)
                    if deadline.is_none_or(|deadline| {
                        now.checked_add(wait).is_some_and(|end| end <= deadline)
                    }) =>
                {
                    debug!(wait_ms = wait.as_millis(), "waiting for rate limit tokens");
                    tokio::time::sleep(wait).await;
                }
                _ => {
                    debug!("rate limit tokens unavailable before deadline");
                    return Err(RateLimitError::Timeout {
                        waited: now.saturating_duration_since(start),
                    });
                }
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn record_wait(&self, waited: Duration) {
        let waited_ms = waited.as_millis() as u64;
        let total = self
            .cumulative_wait_ms
            .fetch_add(waited_ms, Ordering::SeqCst)
            + waited_ms;
        let cumulative = Duration::from_millis(total);

        debug!(
            waited_ms,
            cumulative_ms = total,
            "rate limit delay applied"
        );

        if cumulative >= CUMULATIVE_WAIT_WARNING_THRESHOLD
            && cumulative.saturating_sub(waited) < CUMULATIVE_WAIT_WARNING_THRESHOLD
        {
            warn!(
                cumulative_wait_secs = cumulative.as_secs(),
                "excessive rate limiting - consider raising the refill rate or lowering concurrency"
            );
        }
    }
}

fn take(bucket: &mut Bucket, n: u32) -> bool {
    let wanted = f64::from(n);
    if bucket.tokens + TOKEN_EPSILON >= wanted {
        bucket.tokens = (bucket.tokens - wanted).max(0.0);
        true
    } else {
        false
    }
}

/// Extracts the host from a URL, used as the circuit breaker key.
///
/// Returns "unknown" for malformed URLs, ensuring every request still maps
/// onto some breaker.
///
/// # Examples
///
/// ```
/// use chapterdl_core::download::rate_limiter::extract_domain;
///
/// assert_eq!(extract_domain("https://example.com/path"), "example.com");
/// assert_eq!(extract_domain("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use chapterdl_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();

        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            debug!(
                header_value,
                "Retry-After date is in the past, returning zero"
            );
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_per_sec: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            capacity,
            refill_per_sec,
        })
    }

    // ==================== RateLimiter Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_capacity_then_refuse() {
        let limiter = limiter(5, 1.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire(1));
        }
        assert!(!limiter.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_one_token_interval() {
        let limiter = limiter(2, 4.0);
        assert!(limiter.try_acquire(2));
        assert!(!limiter.try_acquire(1));

        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(limiter.try_acquire(1));
        assert!(!limiter.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = limiter(3, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.available() <= 3.0);
        assert!(limiter.try_acquire(3));
        assert!(limiter.available() >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanishing_refill_rate_times_out_instead_of_overflowing() {
        let limiter = limiter(1, 1e-300);
        assert!(limiter.try_acquire(1));

        let err = limiter.acquire(1, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
        let err = limiter.acquire(1, Duration::MAX).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = limiter(1, 2.0);
        assert!(limiter.try_acquire(1));

        let start = Instant::now();
        limiter.acquire(1, Duration::from_secs(5)).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
        assert!(waited < Duration::from_millis(600), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let limiter = limiter(1, 0.5);
        assert!(limiter.try_acquire(1));

        let err = limiter
            .acquire(1, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_more_than_capacity_fails_immediately() {
        let limiter = limiter(2, 1.0);
        let err = limiter.acquire(3, Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(
            err,
            RateLimitError::ExceedsCapacity {
                requested: 3,
                capacity: 2
            }
        );
        assert!(!limiter.try_acquire(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_always_grants() {
        let limiter = RateLimiter::disabled();
        assert!(limiter.is_disabled());
        for _ in 0..1000 {
            assert!(limiter.try_acquire(1));
        }
        limiter.acquire(50, Duration::ZERO).await.unwrap();
        assert!(limiter.available().is_infinite());
    }

    #[test]
    fn test_timeout_maps_to_source_error() {
        let source: SourceError = RateLimitError::Timeout {
            waited: Duration::from_secs(2),
        }
        .into();
        assert_eq!(source.kind(), crate::queue::ErrorKind::RateLimitTimeout);
    }

    // ==================== extract_domain Tests ====================

    #[test]
    fn test_extract_domain_valid_https() {
        assert_eq!(
            extract_domain("https://example.com/path/001.jpg"),
            "example.com"
        );
    }

    #[test]
    fn test_extract_domain_lowercase() {
        assert_eq!(extract_domain("https://Example.COM/Path"), "example.com");
    }

    #[test]
    fn test_extract_domain_with_port() {
        assert_eq!(
            extract_domain("https://example.com:8080/path"),
            "example.com"
        );
    }

    #[test]
    fn test_extract_domain_malformed_url() {
        assert_eq!(extract_domain("not a valid url"), "unknown");
        assert_eq!(extract_domain(""), "unknown");
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("  120  "), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("invalid"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_retry_after("3600"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        let past_date = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past_date), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let future_date = httpdate::fmt_http_date(future_time);

        let duration = parse_retry_after(&future_date).unwrap();
        assert!(
            duration >= Duration::from_secs(55) && duration <= Duration::from_secs(65),
            "Duration should be ~60s, got {duration:?}"
        );
    }
}
