//! Constants for the download module (HTTP timeouts, disk estimates).

use std::time::Duration;

/// Default HTTP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default whole-request timeout for one page or manifest fetch.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a caller waits for a rate-limit token before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Assumed size of one page when checking free disk space before a chapter.
pub const DEFAULT_ESTIMATED_PAGE_BYTES: u64 = 2 * 1024 * 1024;
