//! Coordinator configuration.
//!
//! [`CoordinatorConfig`] collects every knob of the orchestration core. The
//! binary fills it from defaults, an optional config file and CLI flags; the
//! library only requires that [`CoordinatorConfig::validate`] passes.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::{
    CircuitBreakerConfig, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_ESTIMATED_PAGE_BYTES, DEFAULT_MAX_RETRIES,
    DEFAULT_REQUEST_TIMEOUT, MIN_REFILL_PER_SEC, RateLimiter, RateLimiterConfig, RetryPolicy,
};
use crate::queue::DuplicatePolicy;

/// Default number of chapters downloaded at once.
pub const DEFAULT_JOB_WORKERS: usize = 1;

/// Default page fetches per chapter.
pub const DEFAULT_PAGE_WORKERS_PER_JOB: usize = 4;

/// Default page fetches across all chapters.
pub const DEFAULT_GLOBAL_PAGE_WORKERS: usize = 16;

/// Accepted range for [`CoordinatorConfig::job_workers`].
pub const JOB_WORKERS_RANGE: RangeInclusive<usize> = 1..=10;

/// Accepted range for [`CoordinatorConfig::page_workers_per_job`].
pub const PAGE_WORKERS_RANGE: RangeInclusive<usize> = 1..=32;

/// Accepted range for [`CoordinatorConfig::global_page_workers`].
pub const GLOBAL_PAGE_WORKERS_RANGE: RangeInclusive<usize> = 1..=128;

/// Accepted range for retry attempts.
pub const MAX_ATTEMPTS_RANGE: RangeInclusive<u32> = 1..=10;

const TIMEOUT_SECS_RANGE: RangeInclusive<u64> = 1..=3600;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A numeric value is outside its accepted range.
    #[error("invalid value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Rejected value, rendered.
        value: String,
        /// Accepted range, rendered.
        expected: String,
    },

    /// Two values contradict each other or a value is meaningless.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
}

pub(crate) fn check_range<T>(
    field: &'static str,
    value: T,
    range: &RangeInclusive<T>,
) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected: format!("{}..={}", range.start(), range.end()),
        })
    }
}

fn check_timeout(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    let secs = value.as_secs();
    if value.is_zero() || secs > *TIMEOUT_SECS_RANGE.end() {
        return Err(ConfigError::OutOfRange {
            field,
            value: format!("{}ms", value.as_millis()),
            expected: format!(
                "{}s..={}s",
                TIMEOUT_SECS_RANGE.start(),
                TIMEOUT_SECS_RANGE.end()
            ),
        });
    }
    Ok(())
}

/// Backoff settings, turned into a [`RetryPolicy`] by [`RetrySettings::policy`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f32,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(32),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetrySettings {
    /// Builds the retry policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.base_delay,
            self.max_delay,
            self.multiplier,
        )
        .with_jitter(self.jitter)
    }
}

/// Every setting of a [`crate::Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Chapters downloaded concurrently.
    pub job_workers: usize,
    /// Page fetches per chapter.
    pub page_workers_per_job: usize,
    /// Page fetches across all chapters.
    pub global_page_workers: usize,
    /// Whole-request timeout of the HTTP client.
    pub request_timeout: Duration,
    /// Backoff for parser resolves and page fetches.
    pub retry: RetrySettings,
    /// Token bucket for upstream requests; `None` disables rate limiting.
    pub rate_limit: Option<RateLimiterConfig>,
    /// Longest wait for a rate limiter token.
    pub acquire_timeout: Duration,
    /// Per-host circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// How enqueueing a URL that is already queued is handled.
    pub duplicate_policy: DuplicatePolicy,
    /// Fail a chapter when converters are enabled but none produced output.
    pub require_converter_output: bool,
    /// Assumed bytes per page when checking free disk space; 0 skips the check.
    pub estimated_page_bytes: u64,
    /// Chapter directories are created below this directory.
    pub output_root: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            job_workers: DEFAULT_JOB_WORKERS,
            page_workers_per_job: DEFAULT_PAGE_WORKERS_PER_JOB,
            global_page_workers: DEFAULT_GLOBAL_PAGE_WORKERS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetrySettings::default(),
            rate_limit: Some(RateLimiterConfig::default()),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            circuit_breaker: CircuitBreakerConfig::default(),
            duplicate_policy: DuplicatePolicy::default(),
            require_converter_output: true,
            estimated_page_bytes: DEFAULT_ESTIMATED_PAGE_BYTES,
            output_root: PathBuf::from("."),
        }
    }
}

impl CoordinatorConfig {
    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first offending field as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("job_workers", self.job_workers, &JOB_WORKERS_RANGE)?;
        check_range(
            "page_workers_per_job",
            self.page_workers_per_job,
            &PAGE_WORKERS_RANGE,
        )?;
        check_range(
            "global_page_workers",
            self.global_page_workers,
            &GLOBAL_PAGE_WORKERS_RANGE,
        )?;
        check_timeout("request_timeout", self.request_timeout)?;
        check_timeout("acquire_timeout", self.acquire_timeout)?;

        check_range("max_attempts", self.retry.max_attempts, &MAX_ATTEMPTS_RANGE)?;
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "retry_multiplier",
                reason: format!("{} must be a finite number >= 1", self.retry.multiplier),
            });
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid {
                field: "retry_base_delay",
                reason: "must not exceed retry_max_delay".to_string(),
            });
        }

        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.capacity == 0 {
                return Err(ConfigError::Invalid {
                    field: "rate_limit_capacity",
                    reason: "must be at least 1".to_string(),
                });
            }
            if !rate_limit.refill_per_sec.is_finite()
                || rate_limit.refill_per_sec < MIN_REFILL_PER_SEC
            {
                return Err(ConfigError::Invalid {
                    field: "rate_limit_refill_per_sec",
                    reason: format!(
                        "{} must be a number >= {MIN_REFILL_PER_SEC}",
                        rate_limit.refill_per_sec
                    ),
                });
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "failure_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        check_timeout("cool_down", self.circuit_breaker.cool_down)?;
        Ok(())
    }

    /// Builds the shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        match self.rate_limit {
            Some(config) => RateLimiter::new(config),
            None => RateLimiter::disabled(),
        }
    }
}
