//! Reference converter packing pages into a CBZ (zip) archive.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};
use zip::ZipWriter;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;

use super::{ChapterMetadata, Converter, Plugin};
use crate::download::sanitize_filename;

/// Registry name of [`CbzConverter`].
pub const CBZ_CONVERTER_NAME: &str = "cbz";

#[derive(Debug, Error)]
enum CbzError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] ZipError),
}

impl CbzError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes `<output_dir>/<chapter name>.cbz` with entries `001.jpg`, `002.png`, ...
///
/// Pages are stored in the order given, which is the chapter's reading order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CbzConverter;

impl CbzConverter {
    /// Creates the converter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn write_archive(files: &[PathBuf], archive_path: &Path) -> Result<(), CbzError> {
        let file = File::create(archive_path).map_err(|e| CbzError::io(archive_path, e))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for (index, page) in files.iter().enumerate() {
            let extension = page
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| format!(".{}", ext.to_lowercase()))
                .unwrap_or_default();
            let entry_name = format!("{:03}{extension}", index + 1);

            let mut reader =
                BufReader::new(File::open(page).map_err(|e| CbzError::io(page, e))?);
            zip.start_file(entry_name, options)?;
            io::copy(&mut reader, &mut zip).map_err(|e| CbzError::io(page, e))?;
        }

        let mut writer = zip.finish()?;
        io::Write::flush(&mut writer).map_err(|e| CbzError::io(archive_path, e))?;
        Ok(())
    }
}

impl Plugin for CbzConverter {
    fn name(&self) -> &str {
        CBZ_CONVERTER_NAME
    }
}

impl Converter for CbzConverter {
    fn output_extension(&self) -> &str {
        ".cbz"
    }

    fn convert(
        &self,
        files: &[PathBuf],
        output_dir: &Path,
        metadata: &ChapterMetadata,
    ) -> Option<PathBuf> {
        let chapter_name = metadata.chapter_name();
        if files.is_empty() {
            warn!(chapter = %chapter_name, "CBZ converter received no pages");
            return None;
        }

        let file_name = format!(
            "{}{}",
            sanitize_filename(&chapter_name),
            self.output_extension()
        );
        let archive_path = output_dir.join(file_name);

        match Self::write_archive(files, &archive_path) {
            Ok(()) => {
                info!(path = %archive_path.display(), pages = files.len(), "Created CBZ");
                Some(archive_path)
            }
            Err(error) => {
                warn!(chapter = %chapter_name, error = %error, "CBZ conversion failed");
                if archive_path.exists()
                    && let Err(remove_error) = std::fs::remove_file(&archive_path)
                {
                    warn!(
                        path = %archive_path.display(),
                        error = %remove_error,
                        "Failed to remove partial archive"
                    );
                }
                None
            }
        }
    }
}
