//! Plugin contracts: parsers, converters and resource fetchers.
//!
//! A [`Parser`] turns a chapter URL into a [`ResourceList`]. A
//! [`ResourceFetcher`] stores one resource on disk. A [`Converter`] packs the
//! stored pages into an output file. None of them touch the queue, and none
//! retry or rate-limit on their own; the job pipeline does that around them.
//!
//! Plugins are registered in ordered [`PluginRegistry`] lists scoped to a
//! coordinator. Order matters: the first enabled parser whose
//! [`Parser::can_handle`] accepts a URL wins, and converters run in
//! registration order.

mod cbz;
mod error;
mod manifest;
mod registry;

pub use cbz::{CBZ_CONVERTER_NAME, CbzConverter};
pub use error::SourceError;
pub use manifest::{MANIFEST_PARSER_NAME, ManifestParser};
pub use registry::{ConverterRegistry, ParserRegistry, PluginRegistry, PluginStatus};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::download::compose_chapter_name;

/// What a parser found behind a chapter URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    /// Series or work title.
    #[serde(default)]
    pub title: String,
    /// Chapter identifier (number or name).
    #[serde(default)]
    pub chapter: String,
    /// Page URLs in reading order.
    #[serde(default, alias = "images")]
    pub resources: Vec<String>,
}

impl ResourceList {
    /// `"<title> - <chapter>"`, skipping empty parts, or `"Chapter"` if both are empty.
    #[must_use]
    pub fn chapter_name(&self) -> String {
        compose_chapter_name(&self.title, &self.chapter)
    }
}

/// Context handed to converters alongside the stored pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterMetadata {
    /// Series or work title.
    pub title: String,
    /// Chapter identifier.
    pub chapter: String,
    /// The chapter URL the job was created from.
    pub source_url: String,
}

impl ChapterMetadata {
    /// Builds metadata from a resolved resource list.
    #[must_use]
    pub fn from_resources(resources: &ResourceList, source_url: &str) -> Self {
        Self {
            title: resources.title.clone(),
            chapter: resources.chapter.clone(),
            source_url: source_url.to_string(),
        }
    }

    /// `"<title> - <chapter>"`, skipping empty parts.
    #[must_use]
    pub fn chapter_name(&self) -> String {
        compose_chapter_name(&self.title, &self.chapter)
    }
}

/// One resource to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Resource URL.
    pub url: String,
    /// 1-based position in the chapter; used for the file name.
    pub index: usize,
    /// Directory to write into.
    pub dir: PathBuf,
    /// Page the resource belongs to, sent as `Referer`.
    pub referer: Option<String>,
}

/// Common surface of every plugin.
pub trait Plugin: Send + Sync {
    /// Unique name within its registry.
    fn name(&self) -> &str;
}

/// Site parser.
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Arc<dyn Parser>` in the registry.
#[async_trait]
pub trait Parser: Plugin {
    /// Returns true if this parser understands `url`.
    fn can_handle(&self, url: &str) -> bool;

    /// Resolves a chapter URL into its page list.
    async fn resolve(&self, url: &str) -> Result<ResourceList, SourceError>;
}

/// Output format converter.
///
/// Runs on a blocking thread. Must only write inside `output_dir`.
pub trait Converter: Plugin {
    /// File extension of produced outputs, including the dot.
    fn output_extension(&self) -> &str;

    /// Converts the stored pages into one output file.
    ///
    /// Returns `None` on a recoverable failure; the next converter still runs.
    fn convert(
        &self,
        files: &[PathBuf],
        output_dir: &Path,
        metadata: &ChapterMetadata,
    ) -> Option<PathBuf>;
}

/// Stores one resource on disk.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetches `request.url` into `request.dir`, returning the written path.
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, SourceError>;
}
