//! Free space preflight for chapter directories.

use std::path::Path;

use tracing::{debug, warn};

use super::DownloadError;

/// Checks that `dir` can hold `pages` pages of about `page_bytes` each.
///
/// A `page_bytes` of 0 disables the check. If the free space cannot be
/// determined the download goes ahead and a warning is logged.
///
/// # Errors
///
/// Returns [`DownloadError::InsufficientSpace`] when the estimate does not fit.
pub fn ensure_free_space(dir: &Path, pages: usize, page_bytes: u64) -> Result<(), DownloadError> {
    if page_bytes == 0 {
        return Ok(());
    }
    let required = page_bytes.saturating_mul(u64::try_from(pages).unwrap_or(u64::MAX));
    let available = match fs2::available_space(dir) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Could not determine free disk space");
            return Ok(());
        }
    };

    if available < required {
        warn!(
            dir = %dir.display(),
            available,
            required,
            "Insufficient disk space"
        );
        return Err(DownloadError::InsufficientSpace {
            path: dir.to_path_buf(),
            available,
            required,
        });
    }
    debug!(available, required, "Disk space OK");
    Ok(())
}
