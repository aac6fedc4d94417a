//! Chapter directory and page file naming.
//!
//! Pages are stored as `<output_root>/<chapter name>/<NNN><ext>`. The chapter
//! name comes from parser metadata and is sanitized before it touches the
//! filesystem; the extension comes from the resource URL, then the response
//! Content-Type, then [`DEFAULT_PAGE_EXTENSION`].

use std::path::{Component, Path, PathBuf};

use url::Url;

use super::error::DownloadError;

/// Extension used when neither the URL nor the Content-Type names one.
pub const DEFAULT_PAGE_EXTENSION: &str = ".jpg";

/// Extensions recognised as page images when collecting stored files.
pub const IMAGE_EXTENSIONS: [&str; 6] = [".png", ".jpg", ".jpeg", ".gif", ".bmp", ".webp"];

/// Builds the human-facing chapter label `"<title> - <chapter>"`.
///
/// Empty or whitespace-only parts are skipped; `"Chapter"` is returned when
/// both are empty.
#[must_use]
pub fn compose_chapter_name(title: &str, chapter: &str) -> String {
    let parts: Vec<&str> = [title, chapter]
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return "Chapter".to_string();
    }
    parts
        .join(" - ")
        .trim_matches(|c| c == ' ' || c == '-')
        .to_string()
}

/// Lowercased extension (with dot) of the last URL path segment.
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > 6 || !ext[1..].chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Extension for an `image/*` Content-Type, e.g. `image/png` -> `.png`.
pub(crate) fn extension_from_content_type(content_type: &str) -> Option<String> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let subtype = mime.strip_prefix("image/")?;
    let subtype: String = subtype
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    match subtype.as_str() {
        "" => None,
        "jpeg" | "pjpeg" => Some(".jpg".to_string()),
        other => Some(format!(".{other}")),
    }
}

/// Picks the page extension: URL path, then Content-Type, then the default.
pub(crate) fn page_extension(url: &str, content_type: Option<&str>) -> String {
    extension_from_url(url)
        .or_else(|| content_type.and_then(extension_from_content_type))
        .unwrap_or_else(|| DEFAULT_PAGE_EXTENSION.to_string())
}

/// `001.jpg`, `002.png`, ... for a 1-based page index.
pub(crate) fn page_file_name(index: usize, extension: &str) -> String {
    format!("{index:03}{extension}")
}

/// Returns true if `path` has one of the [`IMAGE_EXTENSIONS`].
#[must_use]
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            let dotted = format!(".{}", ext.to_lowercase());
            IMAGE_EXTENSIONS.contains(&dotted.as_str())
        })
}

/// Sanitizes a name for use as a single path segment.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

/// Resolves the directory for a chapter under `root`.
///
/// # Errors
///
/// Returns [`DownloadError::UnsafePath`] if the sanitized name would still
/// resolve outside `root`.
pub fn chapter_dir(root: &Path, chapter_name: &str) -> Result<PathBuf, DownloadError> {
    let segment = sanitize_filename(chapter_name);
    if !is_safe_filename_segment(&segment) {
        return Err(DownloadError::unsafe_path(root.join(&segment)));
    }
    let dir = root.join(&segment);
    if dir.parent() != Some(root) {
        return Err(DownloadError::unsafe_path(dir));
    }
    Ok(dir)
}
