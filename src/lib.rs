//! Chapter Download Core Library
//!
//! This library schedules chapter downloads: each queued chapter URL is
//! resolved into a page list by a site parser, its pages are fetched
//! concurrently under per-job and global bounds, and the stored pages are
//! handed to output converters.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`queue`] - Job records and their state machine
//! - [`job`] - Job tasks and the bounded job executor
//! - [`download`] - Page pool, rate limiter, circuit breaker, retry and HTTP fetching
//! - [`plugin`] - Parser, converter and fetcher contracts plus reference plugins
//! - [`config`] - Coordinator settings and validation
//! - [`coordinator`] - Composition root and control surface

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod coordinator;
pub mod download;
pub mod job;
pub mod plugin;
pub mod queue;
pub(crate) mod user_agent;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, CoordinatorConfig, RetrySettings};
pub use coordinator::{Coordinator, CoordinatorError, ShutdownReport};
pub use download::{
    CircuitBreakerConfig, CircuitState, DEFAULT_MAX_RETRIES, FailureType, HttpFetcher, PagePool,
    RateLimiter, RateLimiterConfig, RetryDecision, RetryPolicy, classify_error,
};
pub use plugin::{
    CbzConverter, ChapterMetadata, Converter, FetchRequest, ManifestParser, Parser, Plugin,
    ResourceFetcher, ResourceList, SourceError,
};
pub use queue::{
    CancelOutcome, DuplicatePolicy, ErrorKind, JobId, JobRecord, JobState, QueueChange,
    QueueError, QueueObserver, QueueSnapshot, TracingObserver,
};
