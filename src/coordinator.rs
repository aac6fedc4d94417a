//! Composition root of the download core.
//!
//! A [`Coordinator`] owns the queue, the plugin registries, the two worker
//! pools and the upstream guard. Callers enqueue chapter URLs and observe
//! progress through [`Coordinator::snapshot`] or a [`QueueObserver`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use chapterdl_core::{Coordinator, CoordinatorConfig};
//!
//! # async fn example() -> Result<(), chapterdl_core::CoordinatorError> {
//! let coordinator = Coordinator::with_default_plugins(CoordinatorConfig::default())?;
//! coordinator.enqueue("https://example.com/series/12/manifest.json")?;
//! coordinator.wait_idle().await;
//!
//! let report = coordinator.shutdown(Duration::from_secs(5)).await;
//! assert!(report.drained);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{
    ConfigError, CoordinatorConfig, GLOBAL_PAGE_WORKERS_RANGE, JOB_WORKERS_RANGE,
    PAGE_WORKERS_RANGE, check_range,
};
use crate::download::{
    CallStats, CircuitBreakerRegistry, CircuitBreakerStats, DownloadError, HttpFetcher, PagePool,
    UpstreamGuard,
};
use crate::job::{JobContext, JobExecutor, PauseGate, SubmitError};
use crate::plugin::{
    CbzConverter, ConverterRegistry, ManifestParser, ParserRegistry, ResourceFetcher,
};
use crate::queue::{
    CancelOutcome, JobId, JobRecord, QueueError, QueueManager, QueueObserver, QueueSnapshot,
};

/// Errors returned by [`Coordinator`] operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// [`Coordinator::shutdown`] has started; no new work is accepted.
    #[error("coordinator is shutting down")]
    ShuttingDown,

    /// The queue refused the operation.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error("HTTP setup failed: {0}")]
    Http(#[from] DownloadError),

    /// The executor refused a job.
    #[error(transparent)]
    Submit(SubmitError),
}

/// Outcome of [`Coordinator::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every job finished on its own within the drain timeout.
    pub drained: bool,
    /// Jobs that were still unfinished when cancellation was forced.
    pub forced: usize,
}

/// Owns every component and exposes the public control surface.
pub struct Coordinator {
    queue: Arc<QueueManager>,
    ctx: Arc<JobContext>,
    executor: JobExecutor,
    root_cancel: CancellationToken,
    accepting: AtomicBool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("executor", &self.executor)
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Builds a coordinator with empty plugin registries.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Config`] if `config` does not validate.
    pub fn new(
        config: CoordinatorConfig,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let root_cancel = CancellationToken::new();
        let queue = Arc::new(QueueManager::with_cancel_root(
            config.duplicate_policy,
            root_cancel.clone(),
        ));
        let guard = UpstreamGuard::new(
            Arc::new(config.rate_limiter()),
            Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            config.retry.policy(),
            config.acquire_timeout,
        );
        let ctx = Arc::new(JobContext {
            queue: Arc::clone(&queue),
            parsers: Arc::new(ParserRegistry::new()),
            converters: Arc::new(ConverterRegistry::new()),
            fetcher,
            guard,
            pages: PagePool::new(config.page_workers_per_job, config.global_page_workers),
            pause: PauseGate::new(),
            output_root: config.output_root.clone(),
            require_converter_output: config.require_converter_output,
            estimated_page_bytes: config.estimated_page_bytes,
        });
        let executor = JobExecutor::new(Arc::clone(&ctx), config.job_workers);

        info!(
            job_workers = config.job_workers,
            page_workers_per_job = config.page_workers_per_job,
            global_page_workers = config.global_page_workers,
            output_root = %config.output_root.display(),
            "Coordinator ready"
        );

        Ok(Self {
            queue,
            ctx,
            executor,
            root_cancel,
            accepting: AtomicBool::new(true),
        })
    }

    /// Builds a coordinator with the HTTP fetcher, the manifest parser and the
    /// CBZ converter registered.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Config`] for an invalid config and
    /// [`CoordinatorError::Http`] if the HTTP client cannot be built.
    pub fn with_default_plugins(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let fetcher = HttpFetcher::new(config.request_timeout)?;
        let parser = ManifestParser::new(fetcher.client().clone());

        let coordinator = Self::new(config, Arc::new(fetcher))?;
        coordinator.parsers().register(Arc::new(parser));
        coordinator.converters().register(Arc::new(CbzConverter::new()));
        Ok(coordinator)
    }

    /// Site parsers, in the order they are consulted.
    #[must_use]
    pub fn parsers(&self) -> &ParserRegistry {
        &self.ctx.parsers
    }

    /// Output converters, in the order they run.
    #[must_use]
    pub fn converters(&self) -> &ConverterRegistry {
        &self.ctx.converters
    }

    /// Installs the change observer.
    pub fn set_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.queue.set_observer(observer);
    }

    /// Queues a chapter URL and schedules it.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::ShuttingDown`] after [`Coordinator::shutdown`]
    /// - [`CoordinatorError::Queue`] for a duplicate URL
    pub fn enqueue(&self, source_url: &str) -> Result<JobId, CoordinatorError> {
        self.enqueue_with_label(source_url, None)
    }

    /// Like [`Coordinator::enqueue`], with a display label shown until the
    /// parser names the chapter.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::enqueue`].
    #[instrument(skip(self, label), fields(url = %source_url))]
    pub fn enqueue_with_label(
        &self,
        source_url: &str,
        label: Option<String>,
    ) -> Result<JobId, CoordinatorError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }
        let id = self.queue.enqueue(source_url, label)?;
        match self.executor.submit(id) {
            Ok(()) => {
                debug!(job_id = %id, "Job scheduled");
                Ok(id)
            }
            Err(error) => {
                // Shutdown started between the check and the submit.
                if let Err(cancel_error) = self.queue.cancel(id) {
                    debug!(job_id = %id, error = %cancel_error, "Unscheduled job already finished");
                }
                match error {
                    SubmitError::Closed => Err(CoordinatorError::ShuttingDown),
                    other => Err(CoordinatorError::Submit(other)),
                }
            }
        }
    }

    /// Stops new page fetches in every job. In-flight fetches complete.
    pub fn pause_all(&self) {
        if self.ctx.pause.pause() {
            info!("All jobs paused");
        }
    }

    /// Lets paused jobs continue.
    pub fn resume_all(&self) {
        if self.ctx.pause.resume() {
            info!("All jobs resumed");
        }
    }

    /// Returns true while the global pause is in effect.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.ctx.pause.is_paused()
    }

    /// Cancels one job.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Queue`] for unknown or already finished jobs.
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, CoordinatorError> {
        Ok(self.queue.cancel(id)?)
    }

    /// Point-in-time copy of every job.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// Current record of one job.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.queue.get(id)
    }

    /// Changes how many chapters run at once. Jobs already running keep their slot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] outside `1..=10`.
    pub fn resize_job_workers(&self, job_workers: usize) -> Result<(), ConfigError> {
        check_range("job_workers", job_workers, &JOB_WORKERS_RANGE)?;
        self.executor.resize(job_workers);
        Ok(())
    }

    /// Changes both page bounds for fetches submitted from now on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] if either value is outside its range.
    pub fn resize_page_workers(&self, per_job: usize, global: usize) -> Result<(), ConfigError> {
        check_range("page_workers_per_job", per_job, &PAGE_WORKERS_RANGE)?;
        check_range("global_page_workers", global, &GLOBAL_PAGE_WORKERS_RANGE)?;
        self.ctx.pages.resize(per_job, global);
        Ok(())
    }

    /// Removes every finished job. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        self.queue.clear(|_| true)
    }

    /// Removes one finished job.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Queue`] for unknown or unfinished jobs.
    pub fn remove(&self, id: JobId) -> Result<JobRecord, CoordinatorError> {
        Ok(self.queue.remove(id)?)
    }

    /// State of every per-host circuit breaker seen so far.
    #[must_use]
    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.ctx.guard.breakers().stats()
    }

    /// Counters of guarded upstream calls.
    #[must_use]
    pub fn call_stats(&self) -> &CallStats {
        self.ctx.guard.stats()
    }

    /// Waits until no job is queued or running.
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await;
    }

    /// Stops accepting work and winds down.
    ///
    /// Jobs get `drain_timeout` to finish on their own. Whatever is still
    /// unfinished afterwards is cancelled, and this waits until every task has
    /// reached a checkpoint and reported.
    #[instrument(skip(self), fields(drain_timeout_ms = drain_timeout.as_millis()))]
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);
        self.executor.close();
        info!(active = self.executor.active(), "Shutting down");

        if tokio::time::timeout(drain_timeout, self.executor.wait_closed())
            .await
            .is_ok()
        {
            info!("All jobs drained");
            return ShutdownReport {
                drained: true,
                forced: 0,
            };
        }

        let forced = self.queue.unfinished_ids().len();
        warn!(forced, "Drain timeout elapsed, cancelling remaining jobs");
        self.root_cancel.cancel();
        self.executor.wait_closed().await;
        info!("Shutdown complete");
        ShutdownReport {
            drained: false,
            forced,
        }
    }
}
