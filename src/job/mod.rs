//! Job execution: one [`JobTask`] per chapter, scheduled by a [`JobExecutor`].
//!
//! # Overview
//!
//! - [`JobContext`] - Everything a task needs, shared by all tasks of a coordinator
//! - [`JobTask`] - Drives one job from Running to a terminal state
//! - [`JobExecutor`] - Bounded pool of job tasks
//! - [`PauseGate`] - Global pause flag observed at task checkpoints

mod executor;
mod pause;
mod task;

pub use executor::{JobExecutor, SubmitError};
pub use pause::PauseGate;
pub use task::{JobTask, TerminalOutcome};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::download::{PagePool, UpstreamGuard};
use crate::plugin::{ConverterRegistry, ParserRegistry, ResourceFetcher};
use crate::queue::QueueManager;

/// Shared dependencies of every job task.
#[derive(Clone)]
pub struct JobContext {
    /// Authoritative job records.
    pub queue: Arc<QueueManager>,
    /// Ordered site parsers.
    pub parsers: Arc<ParserRegistry>,
    /// Ordered output converters.
    pub converters: Arc<ConverterRegistry>,
    /// Stores single resources on disk.
    pub fetcher: Arc<dyn ResourceFetcher>,
    /// Rate limiting, circuit breaking and retry around upstream calls.
    pub guard: UpstreamGuard,
    /// Page fetch slots.
    pub pages: PagePool,
    /// Global pause flag.
    pub pause: PauseGate,
    /// Chapter directories are created below this root.
    pub output_root: PathBuf,
    /// Fail jobs when converters are enabled but none produced output.
    pub require_converter_output: bool,
    /// Assumed bytes per page for the free space check; 0 skips it.
    pub estimated_page_bytes: u64,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("parsers", &self.parsers)
            .field("converters", &self.converters)
            .field("output_root", &self.output_root)
            .field("require_converter_output", &self.require_converter_output)
            .field("estimated_page_bytes", &self.estimated_page_bytes)
            .finish_non_exhaustive()
    }
}
