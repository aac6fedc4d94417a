//! Reference HTTP resource fetcher.
//!
//! [`HttpFetcher`] streams one page at a time to `<dir>/<NNN><ext>` and is
//! designed to be created once and shared across jobs so reqwest's
//! connection pool is reused.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, REFERER, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use super::error::DownloadError;
use super::filename::{page_extension, page_file_name};
use crate::plugin::{FetchRequest, ResourceFetcher, SourceError};
use crate::user_agent;

/// Streams chapter pages to disk over HTTP.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use chapterdl_core::download::HttpFetcher;
/// use chapterdl_core::plugin::{FetchRequest, ResourceFetcher};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = HttpFetcher::new(Duration::from_secs(30))?;
/// let request = FetchRequest {
///     url: "https://cdn.example.com/ch1/page-1.png".to_string(),
///     index: 1,
///     dir: "./downloads/Series - 1".into(),
///     referer: Some("https://example.com/series/1".to_string()),
/// };
/// let path = fetcher.fetch(&request).await?;
/// assert!(path.ends_with("001.png"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher whose requests time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if reqwest cannot build the client.
    pub fn new(request_timeout: Duration) -> Result<Self, DownloadError> {
        Ok(Self {
            client: build_client(request_timeout)?,
        })
    }

    /// Wraps an existing client (shared connection pool).
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Returns the underlying reqwest client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Downloads `request.url` into `request.dir`.
    ///
    /// The directory is created if missing. On any failure after the file was
    /// created the partial file is removed.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] for invalid URLs, HTTP error statuses,
    /// network failures and local IO failures.
    pub async fn download(&self, request: &FetchRequest) -> Result<PathBuf, DownloadError> {
        let url = request.url.trim();
        validate_http_url(url)?;

        let response = send_get(&self.client, url, request.referer.as_deref()).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let extension = page_extension(url, content_type.as_deref());
        let file_path = request.dir.join(page_file_name(request.index, &extension));

        tokio::fs::create_dir_all(&request.dir)
            .await
            .map_err(|e| DownloadError::io(&request.dir, e))?;
        let mut file = File::create(&file_path)
            .await
            .map_err(|e| DownloadError::io(&file_path, e))?;

        match stream_to_file(&mut file, response, url, &file_path).await {
            Ok(bytes) => {
                debug!(bytes, path = %file_path.display(), "Page stored");
                Ok(file_path)
            }
            Err(error) => {
                drop(file);
                if let Err(remove_error) = tokio::fs::remove_file(&file_path).await {
                    warn!(
                        path = %file_path.display(),
                        error = %remove_error,
                        "Failed to remove partial page file"
                    );
                }
                Err(error)
            }
        }
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(url = %request.url, index = request.index))]
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, SourceError> {
        self.download(request).await.map_err(SourceError::from)
    }
}

/// Builds the shared reqwest client used by the reference plugins.
pub(crate) fn build_client(request_timeout: Duration) -> Result<Client, DownloadError> {
    let request_timeout = if request_timeout.is_zero() {
        DEFAULT_REQUEST_TIMEOUT
    } else {
        request_timeout
    };
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
        .timeout(request_timeout)
        .gzip(true)
        .user_agent(user_agent::default_user_agent())
        .build()
        .map_err(DownloadError::ClientBuild)
}

pub(crate) fn validate_http_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DownloadError::invalid_url(url));
    }
    Ok(parsed)
}

/// Sends a GET and turns non-success statuses into [`DownloadError::HttpStatus`].
pub(crate) async fn send_get(
    client: &Client,
    url: &str,
    referer: Option<&str>,
) -> Result<reqwest::Response, DownloadError> {
    let mut request = client.get(url);
    if let Some(referer) = referer {
        request = request.header(REFERER, referer);
    }

    let response = request
        .send()
        .await
        .map_err(|e| DownloadError::network(url, e))?;

    if !response.status().is_success() {
        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        return Err(DownloadError::http_status_with_retry_after(
            url,
            status_code,
            retry_after,
        ));
    }

    Ok(response)
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::network(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}
