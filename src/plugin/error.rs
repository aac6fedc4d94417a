//! Error type shared by every call that reaches outside the process.
//!
//! Parsers, resource fetchers and the rate limiter / circuit breaker wrappers
//! all report failures as [`SourceError`]. Its variants carry exactly the
//! information the retry policy needs to decide whether another attempt
//! could help.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::queue::ErrorKind;

/// Errors produced while resolving or fetching chapter resources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Temporary upstream or network failure; another attempt may succeed.
    #[error("transient failure for {url}: {message}")]
    Transient {
        /// The URL being fetched.
        url: String,
        /// Human-readable cause.
        message: String,
    },

    /// Upstream answered HTTP 429.
    #[error("rate limited by upstream for {url}")]
    RateLimited {
        /// The URL being fetched.
        url: String,
        /// Server-mandated delay from the Retry-After header.
        retry_after: Option<Duration>,
    },

    /// Upstream rejected the request or returned unusable content.
    #[error("upstream rejected {url}: {message}")]
    Rejected {
        /// The URL being fetched.
        url: String,
        /// Human-readable cause.
        message: String,
    },

    /// The circuit for this upstream is open; the call was not attempted.
    #[error("circuit for '{host}' is open, retry after {}ms", retry_after.as_millis())]
    CircuitOpen {
        /// Upstream key of the open circuit.
        host: String,
        /// Remaining cool-down.
        retry_after: Duration,
    },

    /// No rate-limit token became available in time.
    #[error("rate limiter timed out after {}ms", waited.as_millis())]
    RateLimitTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// Local file system failure while storing a resource.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A plugin misbehaved (panicked or returned an internal error).
    #[error("plugin '{plugin}' failed: {message}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// Human-readable cause.
        message: String,
    },
}

impl SourceError {
    /// Creates a transient error.
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a rejected-content error.
    pub fn rejected(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a plugin-internal error.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Maps this error onto the job-level error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } | Self::RateLimited { .. } => ErrorKind::TransientNetwork,
            Self::Rejected { .. } => ErrorKind::UpstreamRejected,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimitTimeout { .. } => ErrorKind::RateLimitTimeout,
            Self::Io { .. } => ErrorKind::LocalIo,
            Self::Plugin { .. } => ErrorKind::PluginInternal,
        }
    }

    /// Returns true if this error should count against the upstream's circuit.
    ///
    /// Only failures that say something about the upstream's health trip the
    /// breaker; rejected content, local IO and plugin bugs do not.
    #[must_use]
    pub fn should_trip_circuit(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }
}
