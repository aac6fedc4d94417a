//! Drives a single chapter job end to end.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::JobContext;
use crate::download::{CallError, chapter_dir, ensure_free_space};
use crate::plugin::{ChapterMetadata, FetchRequest, Parser, ResourceList, SourceError};
use crate::queue::{ErrorDetail, ErrorKind, JobId, JobPatch, JobState, QueueError};

/// How a job task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// Every page was stored and conversion succeeded.
    Success {
        /// Files produced by converters.
        outputs: Vec<PathBuf>,
    },
    /// The job failed.
    Error(ErrorDetail),
    /// Cancellation was observed at a checkpoint.
    Cancelled,
}

impl TerminalOutcome {
    /// The job state this outcome is reported as.
    #[must_use]
    pub fn state(&self) -> JobState {
        match self {
            Self::Success { .. } => JobState::Success,
            Self::Error(_) => JobState::Error,
            Self::Cancelled => JobState::Cancelled,
        }
    }
}

enum Stop {
    Cancelled,
    Failed(ErrorDetail),
}

impl Stop {
    fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed(ErrorDetail::new(kind, message))
    }
}

impl From<CallError> for Stop {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Cancelled => Self::Cancelled,
            CallError::Failed { error, attempts } => Self::Failed(ErrorDetail::new(
                error.kind(),
                format!("{error} (after {attempts} attempts)"),
            )),
        }
    }
}

/// Result of one page fetch, tagged with its 0-based position.
type PageResult = (usize, Result<PathBuf, CallError>);

/// One job's pipeline: parse, fetch pages, convert, report.
///
/// The record must already be [`JobState::Running`] when [`JobTask::run`] is
/// called; the executor performs the `Pending -> Running` transition.
#[derive(Debug)]
pub struct JobTask {
    id: JobId,
    source_url: String,
    cancel: CancellationToken,
    ctx: Arc<JobContext>,
}

impl JobTask {
    /// Creates a task for a job.
    #[must_use]
    pub fn new(
        id: JobId,
        source_url: impl Into<String>,
        cancel: CancellationToken,
        ctx: Arc<JobContext>,
    ) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            cancel,
            ctx,
        }
    }

    /// Runs the pipeline and reports the terminal state to the queue.
    #[instrument(skip(self), fields(job_id = %self.id, url = %self.source_url))]
    pub async fn run(self) -> TerminalOutcome {
        let outcome = match self.execute().await {
            Ok(outputs) => TerminalOutcome::Success { outputs },
            Err(Stop::Cancelled) => TerminalOutcome::Cancelled,
            Err(Stop::Failed(detail)) => TerminalOutcome::Error(detail),
        };
        self.report(&outcome);
        outcome
    }

    async fn execute(&self) -> Result<Vec<PathBuf>, Stop> {
        let parser = self.ctx.parsers.find(&self.source_url).ok_or_else(|| {
            Stop::failed(
                ErrorKind::NoParserAvailable,
                format!("no enabled parser accepts {}", self.source_url),
            )
        })?;
        debug!(parser = parser.name(), "Parser selected");

        self.checkpoint().await?;
        let resources = self.resolve(&parser).await?;
        if resources.resources.is_empty() {
            return Err(Stop::failed(ErrorKind::UpstreamRejected, "no pages found"));
        }

        let chapter_name = resources.chapter_name();
        let dir = chapter_dir(&self.ctx.output_root, &chapter_name)
            .map_err(|e| Stop::failed(ErrorKind::LocalIo, e.to_string()))?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Stop::failed(
                ErrorKind::LocalIo,
                format!("cannot create {}: {e}", dir.display()),
            )
        })?;

        self.publish_resolution(&resources, &chapter_name, &dir)?;
        info!(
            chapter = %chapter_name,
            pages = resources.resources.len(),
            dir = %dir.display(),
            "Chapter resolved"
        );

        ensure_free_space(
            &dir,
            resources.resources.len(),
            self.ctx.estimated_page_bytes,
        )
        .map_err(|e| Stop::failed(ErrorKind::LocalIo, e.to_string()))?;

        let files = self.fetch_pages(&resources.resources, &dir).await?;
        let metadata = ChapterMetadata::from_resources(&resources, &self.source_url);
        self.convert(files, dir, metadata).await
    }

    async fn resolve(&self, parser: &Arc<dyn Parser>) -> Result<ResourceList, Stop> {
        let url = self.source_url.as_str();
        let list = self
            .ctx
            .guard
            .call(url, &self.cancel, || resolve_caught(parser, url))
            .await?;
        Ok(list)
    }

    fn publish_resolution(
        &self,
        resources: &ResourceList,
        chapter_name: &str,
        dir: &Path,
    ) -> Result<(), Stop> {
        let patch = JobPatch {
            total: Some(resources.resources.len()),
            label: Some(chapter_name.to_string()),
            download_dir: Some(dir.to_path_buf()),
            ..JobPatch::default()
        };
        self.ctx
            .queue
            .update(self.id, patch)
            .map(|_| ())
            .map_err(|e| self.queue_violation(&e))
    }

    /// Pause gate, then cancellation.
    async fn checkpoint(&self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        if self.ctx.pause.is_paused() {
            self.move_state(JobState::Running, JobState::Paused);
            let open = self.ctx.pause.wait_open(&self.cancel).await;
            if !open {
                return Err(Stop::Cancelled);
            }
            self.move_state(JobState::Paused, JobState::Running);
        }
        if self.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        Ok(())
    }

    fn move_state(&self, from: JobState, to: JobState) {
        if let Err(e) = self
            .ctx
            .queue
            .transition(self.id, &[from], to, JobPatch::default())
        {
            self.log_queue_error(&e);
        }
    }

    async fn fetch_pages(&self, resources: &[String], dir: &Path) -> Result<Vec<PathBuf>, Stop> {
        let slots = self.ctx.pages.job_slots();
        let failed = Arc::new(AtomicBool::new(false));
        let mut in_flight: JoinSet<PageResult> = JoinSet::new();
        let mut stored: Vec<Option<PathBuf>> = vec![None; resources.len()];
        let mut stop: Option<Stop> = None;

        for (position, url) in resources.iter().enumerate() {
            while let Some(joined) = in_flight.try_join_next() {
                self.collect(joined, &mut stored, &mut stop);
            }
            if stop.is_some() || failed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(reason) = self.checkpoint().await {
                stop = Some(reason);
                break;
            }
            let Some(slot) = slots.acquire(&self.cancel).await else {
                stop = Some(Stop::Cancelled);
                break;
            };
            // The gate may have closed while waiting for the slot.
            if let Err(reason) = self.checkpoint().await {
                stop = Some(reason);
                break;
            }
            if failed.load(Ordering::SeqCst) {
                break;
            }

            let request = FetchRequest {
                url: url.clone(),
                index: position + 1,
                dir: dir.to_path_buf(),
                referer: Some(self.source_url.clone()),
            };
            let ctx = Arc::clone(&self.ctx);
            let cancel = self.cancel.clone();
            let failed = Arc::clone(&failed);
            let id = self.id;
            debug!(index = request.index, url = %request.url, "Submitting page fetch");

            in_flight.spawn(async move {
                let fetcher = Arc::clone(&ctx.fetcher);
                let result = ctx
                    .guard
                    .call(&request.url, &cancel, || fetcher.fetch(&request))
                    .await;
                match &result {
                    Ok(_) => record_progress(&ctx, id),
                    Err(CallError::Failed { .. }) => failed.store(true, Ordering::SeqCst),
                    Err(CallError::Cancelled) => {}
                }
                drop(slot);
                (position, result)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            self.collect(joined, &mut stored, &mut stop);
        }

        if let Some(reason) = stop {
            return Err(reason);
        }
        if self.cancel.is_cancelled() && stored.iter().any(Option::is_none) {
            return Err(Stop::Cancelled);
        }
        Ok(stored.into_iter().flatten().collect())
    }

    fn collect(
        &self,
        joined: Result<PageResult, tokio::task::JoinError>,
        stored: &mut [Option<PathBuf>],
        stop: &mut Option<Stop>,
    ) {
        let reason = match joined {
            Ok((position, Ok(path))) => {
                if let Some(slot) = stored.get_mut(position) {
                    *slot = Some(path);
                }
                return;
            }
            Ok((position, Err(error))) => {
                let reason = Stop::from(error);
                if let Stop::Failed(detail) = &reason {
                    warn!(page = position + 1, error = %detail, "Page fetch failed");
                }
                reason
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!(
                        "page fetch panicked: {}",
                        panic_message(join_error.into_panic().as_ref())
                    )
                } else {
                    "page fetch aborted".to_string()
                };
                warn!(%message, "Page fetch task failed");
                Stop::failed(ErrorKind::PluginInternal, message)
            }
        };
        // First failure wins; a later cancellation does not mask it.
        if stop.is_none()
            || (matches!(stop, Some(Stop::Cancelled)) && matches!(reason, Stop::Failed(_)))
        {
            *stop = Some(reason);
        }
    }

    async fn convert(
        &self,
        files: Vec<PathBuf>,
        dir: PathBuf,
        metadata: ChapterMetadata,
    ) -> Result<Vec<PathBuf>, Stop> {
        let converters = self.ctx.converters.enabled();
        if converters.is_empty() {
            debug!("No converters enabled");
            return Ok(Vec::new());
        }

        let files = Arc::new(files);
        let dir = Arc::new(dir);
        let metadata = Arc::new(metadata);
        let mut outputs = Vec::new();

        for converter in converters {
            self.checkpoint().await?;
            let name = converter.name().to_string();
            let (files, dir, metadata) =
                (Arc::clone(&files), Arc::clone(&dir), Arc::clone(&metadata));

            let joined =
                tokio::task::spawn_blocking(move || converter.convert(&files, &dir, &metadata))
                    .await;
            match joined {
                Ok(Some(path)) => {
                    info!(converter = %name, output = %path.display(), "Converter produced output");
                    outputs.push(path);
                }
                Ok(None) => warn!(converter = %name, "Converter produced no output"),
                Err(join_error) => {
                    let message = if join_error.is_panic() {
                        panic_message(join_error.into_panic().as_ref())
                    } else {
                        "cancelled".to_string()
                    };
                    warn!(converter = %name, %message, "Converter failed");
                }
            }
        }

        if outputs.is_empty() && self.ctx.require_converter_output {
            return Err(Stop::failed(
                ErrorKind::PluginInternal,
                "no converter produced output",
            ));
        }
        Ok(outputs)
    }

    fn report(&self, outcome: &TerminalOutcome) {
        let (from, patch): (&[JobState], JobPatch) = match outcome {
            TerminalOutcome::Success { outputs } => {
                (&[JobState::Running], JobPatch::outputs(outputs.clone()))
            }
            TerminalOutcome::Error(detail) => (
                &[JobState::Running, JobState::Paused],
                JobPatch::error(detail.clone()),
            ),
            TerminalOutcome::Cancelled => {
                (&[JobState::Running, JobState::Paused], JobPatch::default())
            }
        };

        match self
            .ctx
            .queue
            .transition(self.id, from, outcome.state(), patch)
        {
            Ok(record) => debug!(state = %record.state, "Job finished"),
            Err(e) => self.log_queue_error(&e),
        }
    }

    fn queue_violation(&self, error: &QueueError) -> Stop {
        self.log_queue_error(error);
        if error.is_terminal_race() {
            Stop::Cancelled
        } else {
            Stop::failed(ErrorKind::InvalidTransition, error.to_string())
        }
    }

    fn log_queue_error(&self, error: &QueueError) {
        if error.is_terminal_race() {
            debug!(job_id = %self.id, error = %error, "Job already finished elsewhere");
        } else {
            error!(job_id = %self.id, error = %error, "Queue rejected job state report");
        }
    }
}

/// Calls the parser, turning a panic into a plugin error.
async fn resolve_caught(parser: &Arc<dyn Parser>, url: &str) -> Result<ResourceList, SourceError> {
    match AssertUnwindSafe(parser.resolve(url)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(SourceError::plugin(
            parser.name(),
            format!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

fn record_progress(ctx: &JobContext, id: JobId) {
    if let Err(e) = ctx.queue.record_progress(id) {
        if e.is_terminal_race() {
            debug!(job_id = %id, error = %e, "Progress after job finished");
        } else {
            error!(job_id = %id, error = %e, "Queue rejected progress");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
