//! Shared helpers for integration tests: mock plugins and the socket guard.

#![allow(dead_code)]

#[path = "../../src/test_support/socket_guard.rs"]
pub mod socket_guard;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chapterdl_core::{
    ChapterMetadata, Converter, CoordinatorConfig, FetchRequest, Parser, Plugin, ResourceFetcher,
    ResourceList, SourceError,
};
use tokio::sync::Semaphore;

/// Parser accepting every URL under `prefix` and returning `pages` resources.
pub struct StaticParser {
    pub prefix: String,
    pub pages: usize,
    pub resolves: AtomicUsize,
}

impl StaticParser {
    pub fn new(prefix: &str, pages: usize) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_string(),
            pages,
            resolves: AtomicUsize::new(0),
        })
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl Plugin for StaticParser {
    fn name(&self) -> &str {
        "static"
    }
}

#[async_trait]
impl Parser for StaticParser {
    fn can_handle(&self, url: &str) -> bool {
        url.starts_with(&self.prefix)
    }

    async fn resolve(&self, url: &str) -> Result<ResourceList, SourceError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let chapter = url.rsplit('/').next().unwrap_or("1").to_string();
        Ok(ResourceList {
            title: "Series".to_string(),
            chapter,
            resources: (1..=self.pages)
                .map(|i| format!("https://cdn.test/{i:03}.jpg"))
                .collect(),
        })
    }
}

/// Fetcher that writes a small file per page and records concurrency.
///
/// When built with [`GatedFetcher::gated`], every fetch waits for a permit
/// that the test hands out with [`GatedFetcher::release`].
#[derive(Default)]
pub struct GatedFetcher {
    gate: Option<Semaphore>,
    pub calls: AtomicUsize,
    pub completed: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
}

impl GatedFetcher {
    pub fn open() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    /// Lets `n` waiting (or future) fetches finish.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFetcher for GatedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(request.url.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let path = request.dir.join(format!("{:03}.jpg", request.index));
        tokio::fs::write(&path, request.url.as_bytes())
            .await
            .map_err(|e| SourceError::Io {
                path: path.clone(),
                source: e,
            })?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }
}

/// Converter that writes `<name>.out` listing the pages it received.
pub struct ListConverter {
    pub name: &'static str,
}

impl Plugin for ListConverter {
    fn name(&self) -> &str {
        self.name
    }
}

impl Converter for ListConverter {
    fn output_extension(&self) -> &str {
        ".out"
    }

    fn convert(
        &self,
        files: &[PathBuf],
        output_dir: &Path,
        metadata: &ChapterMetadata,
    ) -> Option<PathBuf> {
        let listing: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        let path = output_dir.join(format!("{}{}", metadata.chapter_name(), self.output_extension()));
        std::fs::write(&path, listing.join("\n")).ok()?;
        Some(path)
    }
}

/// Config with no rate limit, one attempt and no jitter, rooted at `root`.
pub fn test_config(root: &Path) -> CoordinatorConfig {
    let mut config = CoordinatorConfig {
        output_root: root.to_path_buf(),
        rate_limit: None,
        ..CoordinatorConfig::default()
    };
    config.retry.max_attempts = 1;
    config.retry.jitter = Duration::ZERO;
    config
}

/// Yields until `condition` holds, panicking after ~5s of real time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Gives spawned tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
