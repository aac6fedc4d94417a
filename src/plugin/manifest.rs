//! Reference parser for JSON chapter manifests.
//!
//! A manifest is a JSON document of the form
//!
//! ```json
//! { "title": "Series", "chapter": "12", "images": ["001.jpg", "https://cdn/002.jpg"] }
//! ```
//!
//! Relative image URLs are resolved against the manifest URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use super::{Parser, Plugin, ResourceList, SourceError};
use crate::download::{DownloadError, build_client, send_get, validate_http_url};

/// Registry name of [`ManifestParser`].
pub const MANIFEST_PARSER_NAME: &str = "manifest";

/// Resolves chapter URLs that point at JSON manifests.
///
/// By default any `http(s)` URL whose path ends in `.json` is accepted;
/// [`ManifestParser::with_prefix`] adds URL prefixes handled regardless of
/// extension.
#[derive(Debug, Clone)]
pub struct ManifestParser {
    client: Client,
    prefixes: Vec<String>,
}

impl ManifestParser {
    /// Creates a parser sharing an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            prefixes: Vec::new(),
        }
    }

    /// Creates a parser with its own client.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the client cannot be built.
    pub fn with_timeout(request_timeout: Duration) -> Result<Self, DownloadError> {
        Ok(Self::new(build_client(request_timeout)?))
    }

    /// Also handles every URL starting with `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    async fn load(&self, url: &str) -> Result<ResourceList, DownloadError> {
        let base = validate_http_url(url)?;
        let response = send_get(&self.client, url, None).await?;
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let mut list: ResourceList = serde_json::from_str(&body)
            .map_err(|e| DownloadError::malformed(url, e.to_string()))?;

        let mut resources = Vec::with_capacity(list.resources.len());
        for raw in &list.resources {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let resolved = base
                .join(raw)
                .map_err(|e| DownloadError::malformed(url, format!("bad image URL '{raw}': {e}")))?;
            resources.push(resolved.to_string());
        }
        list.resources = resources;
        Ok(list)
    }
}

impl Plugin for ManifestParser {
    fn name(&self) -> &str {
        MANIFEST_PARSER_NAME
    }
}

#[async_trait]
impl Parser for ManifestParser {
    fn can_handle(&self, url: &str) -> bool {
        if self.prefixes.iter().any(|p| url.starts_with(p.as_str())) {
            return true;
        }
        validate_http_url(url)
            .is_ok_and(|parsed| parsed.path().to_ascii_lowercase().ends_with(".json"))
    }

    #[instrument(skip(self), fields(parser = MANIFEST_PARSER_NAME))]
    async fn resolve(&self, url: &str) -> Result<ResourceList, SourceError> {
        let list = self.load(url).await?;
        debug!(
            title = %list.title,
            chapter = %list.chapter,
            pages = list.resources.len(),
            "Manifest resolved"
        );
        Ok(list)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::ErrorKind;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn parser() -> ManifestParser {
        ManifestParser::with_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_can_handle_json_urls_and_prefixes() {
        let parser = parser().with_prefix("https://reader.test/api/");
        assert!(parser.can_handle("https://a.test/ch/12.json"));
        assert!(parser.can_handle("https://a.test/ch/12.JSON?v=2"));
        assert!(parser.can_handle("https://reader.test/api/chapter/5"));
        assert!(!parser.can_handle("https://a.test/ch/12"));
        assert!(!parser.can_handle("file:///tmp/12.json"));
        assert!(!parser.can_handle("not a url"));
    }

    #[tokio::test]
    async fn test_resolve_reads_manifest_and_joins_relative_urls() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(path("/series/ch12.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"title":"Series","chapter":"12","images":["p/001.jpg"," ","https://cdn.test/002.png"]}"#,
            ))
            .mount(&mock_server)
            .await;

        let url = format!("{}/series/ch12.json", mock_server.uri());
        let list = parser().resolve(&url).await.unwrap();

        assert_eq!(list.title, "Series");
        assert_eq!(list.chapter, "12");
        assert_eq!(
            list.resources,
            vec![
                format!("{}/series/p/001.jpg", mock_server.uri()),
                "https://cdn.test/002.png".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_rejected() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(path("/bad.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&mock_server)
            .await;

        let url = format!("{}/bad.json", mock_server.uri());
        let error = parser().resolve(&url).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UpstreamRejected);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };

        Mock::given(method("GET"))
            .and(path("/flaky.json"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let url = format!("{}/flaky.json", mock_server.uri());
        let error = parser().resolve(&url).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TransientNetwork);
    }
}
