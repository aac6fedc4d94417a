//! Upstream access for chapter jobs.
//!
//! Everything a job needs to talk to remote hosts safely lives here:
//!
//! - [`RateLimiter`] - token bucket shared by all upstream calls
//! - [`CircuitBreakerRegistry`] - one [`CircuitBreaker`] per host
//! - [`RetryPolicy`] - exponential backoff and error classification
//! - [`UpstreamGuard`] - combines the three around a single call
//! - [`PagePool`] - per-job and global bounds on concurrent page fetches
//! - [`ensure_free_space`] - disk space preflight before a chapter is fetched
//! - [`HttpFetcher`] - reference [`ResourceFetcher`](crate::plugin::ResourceFetcher)
//!   streaming pages to disk
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chapterdl_core::download::{
//!     CircuitBreakerConfig, CircuitBreakerRegistry, HttpFetcher, RateLimiter,
//!     RateLimiterConfig, RetryPolicy, UpstreamGuard,
//! };
//! use chapterdl_core::plugin::{FetchRequest, ResourceFetcher};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = HttpFetcher::new(Duration::from_secs(30))?;
//! let guard = UpstreamGuard::new(
//!     Arc::new(RateLimiter::new(RateLimiterConfig::default())),
//!     Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
//!     RetryPolicy::default(),
//!     Duration::from_secs(60),
//! );
//! let request = FetchRequest {
//!     url: "https://cdn.example.com/1.jpg".to_string(),
//!     index: 1,
//!     dir: "./downloads/Chapter".into(),
//!     referer: None,
//! };
//! let path = guard
//!     .call(&request.url, &CancellationToken::new(), || fetcher.fetch(&request))
//!     .await?;
//! println!("stored {}", path.display());
//! # Ok(())
//! # }
//! ```

mod circuit_breaker;
mod client;
pub(crate) mod constants;
mod disk;
mod engine;
mod error;
mod filename;
mod page_pool;
pub mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use client::HttpFetcher;
pub(crate) use client::{build_client, send_get, validate_http_url};
pub use constants::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_ESTIMATED_PAGE_BYTES, DEFAULT_REQUEST_TIMEOUT,
};
pub use disk::ensure_free_space;
pub use engine::{CallError, CallStats, UpstreamGuard};
pub use error::DownloadError;
pub(crate) use filename::sanitize_filename;
pub use filename::{
    DEFAULT_PAGE_EXTENSION, IMAGE_EXTENSIONS, chapter_dir, compose_chapter_name, is_image_file,
};
pub use page_pool::{JobSlots, PagePool, PageSlot};
pub(crate) use page_pool::SlotLimit;
pub use rate_limiter::{
    MIN_REFILL_PER_SEC, RateLimitError, RateLimiter, RateLimiterConfig, extract_domain,
    parse_retry_after,
};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};

// Note: we do NOT define module-local Result aliases here.
// Use `Result<T, DownloadError>` explicitly in function signatures.
