//! Bounded pool of job tasks.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info_span, warn};

use super::task::panic_message;
use super::{JobContext, JobTask};
use crate::download::SlotLimit;
use crate::queue::{ErrorDetail, ErrorKind, JobId, JobPatch, JobState};

/// Why a job could not be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// A task for this job is already queued or running.
    #[error("job {0} is already scheduled")]
    AlreadyActive(JobId),

    /// The job does not exist in the queue.
    #[error("job {0} not found")]
    UnknownJob(JobId),

    /// Only pending jobs can be scheduled.
    #[error("job {id} is {state}, only pending jobs can be scheduled")]
    NotPending {
        /// Job id.
        id: JobId,
        /// Its current state.
        state: JobState,
    },

    /// The executor no longer accepts work.
    #[error("executor is closed")]
    Closed,
}

struct ExecutorShared {
    job_slots: Arc<SlotLimit>,
    running: AtomicUsize,
    active: Mutex<HashSet<JobId>>,
    active_count: watch::Sender<usize>,
}

impl ExecutorShared {
    fn active(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, id: JobId) {
        let mut active = self.active();
        active.remove(&id);
        self.active_count.send_replace(active.len());
    }
}

/// Releases a job's active marker, even if its task unwinds.
struct ActiveGuard {
    shared: Arc<ExecutorShared>,
    id: JobId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.finish(self.id);
    }
}

struct RunningGuard(Arc<ExecutorShared>);

impl RunningGuard {
    fn enter(shared: &Arc<ExecutorShared>) -> Self {
        shared.running.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(shared))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs job tasks, at most `limit` at a time.
///
/// Each submitted job gets its own tokio task which first waits for a job
/// slot, then moves the record `Pending -> Running` and drives a
/// [`JobTask`]. A job id can only have one task at a time.
pub struct JobExecutor {
    ctx: Arc<JobContext>,
    shared: Arc<ExecutorShared>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("limit", &self.limit())
            .field("running", &self.running())
            .field("active", &self.active())
            .field("closed", &self.tracker.is_closed())
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    /// Creates an executor running at most `job_workers` jobs at once.
    ///
    /// `job_workers` is clamped to at least 1.
    #[must_use]
    pub fn new(ctx: Arc<JobContext>, job_workers: usize) -> Self {
        let limit = job_workers.max(1);
        let (active_count, _rx) = watch::channel(0);
        Self {
            ctx,
            shared: Arc::new(ExecutorShared {
                job_slots: SlotLimit::new(limit),
                running: AtomicUsize::new(0),
                active: Mutex::new(HashSet::new()),
                active_count,
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Current job limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.shared.job_slots.limit()
    }

    /// Jobs currently past their slot and running a task.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Jobs submitted and not yet finished, including those waiting for a slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.shared.active().len()
    }

    /// Returns true if `id` has a task queued or running.
    #[must_use]
    pub fn is_active(&self, id: JobId) -> bool {
        self.shared.active().contains(&id)
    }

    /// Changes the job limit.
    ///
    /// Running jobs are not interrupted. After a shrink, waiting jobs start
    /// only once fewer than the new limit are running.
    pub fn resize(&self, job_workers: usize) {
        let limit = job_workers.max(1);
        self.shared.job_slots.resize(limit);
        debug!(limit, "job executor resized");
    }

    /// Schedules a pending job.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Closed`] after [`JobExecutor::close`]
    /// - [`SubmitError::UnknownJob`] / [`SubmitError::NotPending`] if the record
    ///   is missing or has already left `Pending`
    /// - [`SubmitError::AlreadyActive`] if the job already has a task
    pub fn submit(&self, id: JobId) -> Result<(), SubmitError> {
        if self.tracker.is_closed() {
            return Err(SubmitError::Closed);
        }
        let record = self.ctx.queue.get(id).ok_or(SubmitError::UnknownJob(id))?;
        if record.state != JobState::Pending {
            return Err(SubmitError::NotPending {
                id,
                state: record.state,
            });
        }
        let cancel = self
            .ctx
            .queue
            .cancel_token(id)
            .ok_or(SubmitError::UnknownJob(id))?;

        {
            let mut active = self.shared.active();
            if !active.insert(id) {
                return Err(SubmitError::AlreadyActive(id));
            }
            self.shared.active_count.send_replace(active.len());
        }
        let active_guard = ActiveGuard {
            shared: Arc::clone(&self.shared),
            id,
        };

        let ctx = Arc::clone(&self.ctx);
        let shared = Arc::clone(&self.shared);
        let slots = Arc::clone(&self.shared.job_slots);
        let span = info_span!("job", job_id = %id);

        self.tracker.spawn(
            async move {
                let _active = active_guard;
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = slots.acquire() => permit,
                };
                let Some(_permit) = permit else {
                    // Cancelled before it ever ran; Pending -> Cancelled.
                    if let Err(e) = ctx.queue.cancel(id) {
                        debug!(error = %e, "Job already finished while waiting for a slot");
                    }
                    return;
                };

                if let Err(e) = ctx.queue.transition(
                    id,
                    &[JobState::Pending],
                    JobState::Running,
                    JobPatch::default(),
                ) {
                    if e.is_terminal_race() {
                        debug!(error = %e, "Job cancelled before it started");
                    } else {
                        error!(error = %e, "Could not start job");
                    }
                    return;
                }

                let _running = RunningGuard::enter(&shared);
                let task = JobTask::new(id, record.source_url, cancel, Arc::clone(&ctx));
                if let Err(payload) = AssertUnwindSafe(task.run()).catch_unwind().await {
                    let message = panic_message(payload.as_ref());
                    warn!(%message, "Job task panicked");
                    let detail =
                        ErrorDetail::new(ErrorKind::PluginInternal, format!("panicked: {message}"));
                    if let Err(e) = ctx.queue.transition(
                        id,
                        &[JobState::Running, JobState::Paused],
                        JobState::Error,
                        JobPatch::error(detail),
                    ) {
                        debug!(error = %e, "Panicked job already finished");
                    }
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Stops accepting new submissions. Already submitted jobs keep running.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Returns true once [`JobExecutor::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Waits until every submitted job has finished.
    ///
    /// Unlike [`JobExecutor::wait_closed`], this does not require the
    /// executor to be closed and returns as soon as the pool is empty.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.active_count.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Waits for every task after [`JobExecutor::close`].
    pub async fn wait_closed(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::*;
    use crate::download::{
        CircuitBreakerConfig, CircuitBreakerRegistry, PagePool, RateLimiter, RetryPolicy,
        UpstreamGuard,
    };
    use crate::job::PauseGate;
    use crate::plugin::{
        ConverterRegistry, FetchRequest, Parser, ParserRegistry, Plugin, ResourceFetcher,
        ResourceList, SourceError,
    };
    use crate::queue::{DuplicatePolicy, QueueManager};

    /// Parser that blocks until released and records peak concurrency.
    struct BlockingParser {
        release: Arc<Notify>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Plugin for BlockingParser {
        fn name(&self) -> &str {
            "blocking"
        }
    }

    #[async_trait]
    impl Parser for BlockingParser {
        fn can_handle(&self, _url: &str) -> bool {
            true
        }

        async fn resolve(&self, _url: &str) -> Result<ResourceList, SourceError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ResourceList::default())
        }
    }

    struct NoopFetcher;

    #[async_trait]
    impl ResourceFetcher for NoopFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, SourceError> {
            Ok(request.dir.join("x"))
        }
    }

    fn context(parser: Arc<BlockingParser>, root: &TempDir) -> Arc<JobContext> {
        let parsers = ParserRegistry::new();
        parsers.register(parser);
        Arc::new(JobContext {
            queue: Arc::new(QueueManager::new(DuplicatePolicy::Allow)),
            parsers: Arc::new(parsers),
            converters: Arc::new(ConverterRegistry::new()),
            fetcher: Arc::new(NoopFetcher),
            guard: UpstreamGuard::new(
                Arc::new(RateLimiter::disabled()),
                Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
                RetryPolicy::with_max_attempts(1).with_jitter(Duration::ZERO),
                Duration::from_secs(1),
            ),
            pages: PagePool::new(1, 1),
            pause: PauseGate::new(),
            output_root: root.path().to_path_buf(),
            require_converter_output: false,
            estimated_page_bytes: 0,
        })
    }

    fn blocking_parser() -> Arc<BlockingParser> {
        Arc::new(BlockingParser {
            release: Arc::new(Notify::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_at_most_limit_jobs_run_concurrently() {
        let root = TempDir::new().unwrap();
        let parser = blocking_parser();
        let ctx = context(Arc::clone(&parser), &root);
        let executor = JobExecutor::new(Arc::clone(&ctx), 2);

        for i in 0..6 {
            let id = ctx.queue.enqueue(&format!("https://a.test/{i}"), None).unwrap();
            executor.submit(id).unwrap();
        }
        settle().await;
        assert_eq!(executor.running(), 2);
        assert_eq!(executor.active(), 6);

        while executor.active() > 0 {
            parser.release.notify_waiters();
            settle().await;
        }
        executor.wait_idle().await;

        assert_eq!(parser.peak.load(Ordering::SeqCst), 2);
        let stats = ctx.queue.snapshot().stats;
        assert_eq!(stats.failed, 6, "empty chapters end in error");
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_refused() {
        let root = TempDir::new().unwrap();
        let parser = blocking_parser();
        let ctx = context(Arc::clone(&parser), &root);
        let executor = JobExecutor::new(Arc::clone(&ctx), 1);

        let id = ctx.queue.enqueue("https://a.test/1", None).unwrap();
        executor.submit(id).unwrap();
        assert_eq!(executor.submit(id), Err(SubmitError::AlreadyActive(id)));

        settle().await;
        assert_eq!(
            executor.submit(id),
            Err(SubmitError::NotPending {
                id,
                state: JobState::Running
            })
        );
        parser.release.notify_waiters();
        executor.wait_idle().await;
        assert!(!executor.is_active(id));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_slot() {
        let root = TempDir::new().unwrap();
        let parser = blocking_parser();
        let ctx = context(Arc::clone(&parser), &root);
        let executor = JobExecutor::new(Arc::clone(&ctx), 1);

        let first = ctx.queue.enqueue("https://a.test/1", None).unwrap();
        let second = ctx.queue.enqueue("https://a.test/2", None).unwrap();
        executor.submit(first).unwrap();
        executor.submit(second).unwrap();
        settle().await;

        ctx.queue.cancel(second).unwrap();
        settle().await;
        assert_eq!(ctx.queue.state(second), Some(JobState::Cancelled));
        assert!(!executor.is_active(second));

        parser.release.notify_waiters();
        executor.wait_idle().await;
        assert_eq!(parser.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_executor_refuses_work() {
        let root = TempDir::new().unwrap();
        let ctx = context(blocking_parser(), &root);
        let executor = JobExecutor::new(Arc::clone(&ctx), 1);
        executor.close();

        let id = ctx.queue.enqueue("https://a.test/1", None).unwrap();
        assert_eq!(executor.submit(id), Err(SubmitError::Closed));
        executor.wait_closed().await;
    }

    #[tokio::test]
    async fn test_shrink_waits_for_running_jobs_to_drain() {
        let root = TempDir::new().unwrap();
        let parser = blocking_parser();
        let ctx = context(Arc::clone(&parser), &root);
        let executor = JobExecutor::new(Arc::clone(&ctx), 2);

        for i in 0..5 {
            let id = ctx.queue.enqueue(&format!("https://a.test/{i}"), None).unwrap();
            executor.submit(id).unwrap();
        }
        settle().await;
        assert_eq!(executor.running(), 2);

        executor.resize(1);
        assert_eq!(executor.limit(), 1);
        settle().await;
        assert_eq!(executor.running(), 2, "running jobs keep their slot");

        parser.release.notify_waiters();
        settle().await;
        assert_eq!(executor.running(), 1);
        assert_eq!(parser.current.load(Ordering::SeqCst), 1);

        while executor.active() > 0 {
            parser.release.notify_waiters();
            settle().await;
            assert!(executor.running() <= 1);
        }
        executor.wait_idle().await;
    }

    #[tokio::test]
    async fn test_resize_changes_limit_for_new_jobs() {
        let root = TempDir::new().unwrap();
        let parser = blocking_parser();
        let ctx = context(Arc::clone(&parser), &root);
        let executor = JobExecutor::new(Arc::clone(&ctx), 1);
        executor.resize(3);
        assert_eq!(executor.limit(), 3);

        for i in 0..4 {
            let id = ctx.queue.enqueue(&format!("https://a.test/{i}"), None).unwrap();
            executor.submit(id).unwrap();
        }
        settle().await;
        assert_eq!(executor.running(), 3);

        while executor.active() > 0 {
            parser.release.notify_waiters();
            settle().await;
        }
    }
}
