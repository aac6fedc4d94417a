//! Error types for the HTTP fetch layer.
//!
//! These are the raw transport failures produced by [`HttpFetcher`](super::HttpFetcher)
//! and the reference plugins. They are folded into [`SourceError`] before they
//! reach the job pipeline, which is where retry classification happens.

use std::path::PathBuf;

use thiserror::Error;

use super::rate_limiter::parse_retry_after;
use crate::plugin::SourceError;

/// Errors that can occur while talking to an upstream over HTTP.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// File system error while writing a page (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A derived path would land outside its root directory.
    #[error("refusing to write outside the output root: {path}")]
    UnsafePath {
        /// The rejected path.
        path: PathBuf,
    },

    /// The chapter directory lacks room for the estimated download.
    #[error("insufficient disk space in {path}: {available} bytes free, {required} bytes required")]
    InsufficientSpace {
        /// Directory that was checked.
        path: PathBuf,
        /// Free bytes reported for it.
        available: u64,
        /// Estimated bytes needed.
        required: u64,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// The response body could not be decoded.
    #[error("malformed response from {url}: {message}")]
    Malformed {
        /// The URL whose body was malformed.
        url: String,
        /// What was wrong with it.
        message: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    ///
    /// Timeouts reported by reqwest are mapped to [`DownloadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            return Self::Timeout { url };
        }
        Self::Network { url, source }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an unsafe-path error.
    pub fn unsafe_path(path: impl Into<PathBuf>) -> Self {
        Self::UnsafePath { path: path.into() }
    }

    /// Creates a malformed-body error.
    pub fn malformed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            message: message.into(),
        }
    }
}

impl From<DownloadError> for SourceError {
    fn from(error: DownloadError) -> Self {
        let message = error.to_string();
        match error {
            DownloadError::HttpStatus {
                url,
                status: 429,
                retry_after,
            } => SourceError::RateLimited {
                url,
                retry_after: retry_after.as_deref().and_then(parse_retry_after),
            },
            DownloadError::HttpStatus { url, status, .. }
                if status == 408 || (500..600).contains(&status) =>
            {
                SourceError::transient(url, message)
            }
            DownloadError::HttpStatus { url, .. }
            | DownloadError::InvalidUrl { url }
            | DownloadError::Malformed { url, .. } => SourceError::rejected(url, message),
            DownloadError::Timeout { url } => SourceError::transient(url, message),
            DownloadError::Network { url, source } => {
                if is_tls_error(&source) {
                    SourceError::rejected(url, message)
                } else {
                    SourceError::transient(url, message)
                }
            }
            DownloadError::Io { path, source } => SourceError::Io { path, source },
            DownloadError::UnsafePath { path } => SourceError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, message),
            },
            DownloadError::InsufficientSpace { path, .. } => SourceError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::StorageFull, message),
            },
            DownloadError::ClientBuild(_) => SourceError::plugin("http", message),
        }
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
