//! In-memory job queue and its state machine.
//!
//! The queue owns every [`JobRecord`]. All reads and writes go through one
//! mutex; job tasks never hold a record of their own and report through
//! [`QueueManager::transition`] and [`QueueManager::record_progress`].
//!
//! # Overview
//!
//! - [`QueueManager`] - Main interface for queue operations
//! - [`JobRecord`] - Individual job with progress and error detail
//! - [`JobState`] - Job lifecycle states
//! - [`QueueError`] - Operation error types
//! - [`QueueObserver`] - Change notifications, delivered in mutation order
//!   outside the lock
//!
//! # Example
//!
//! ```
//! use chapterdl_core::queue::{DuplicatePolicy, JobPatch, JobState, QueueManager};
//!
//! let queue = QueueManager::new(DuplicatePolicy::Reject);
//! let id = queue.enqueue("https://example.com/manga/1", None).unwrap();
//!
//! queue
//!     .transition(id, &[JobState::Pending], JobState::Running, JobPatch::default())
//!     .unwrap();
//! assert_eq!(queue.snapshot().stats.active, 1);
//! ```

mod error;
mod item;
mod observer;

pub use error::QueueError;
pub use item::{
    ErrorDetail, ErrorKind, JobId, JobPatch, JobRecord, JobState, Progress, QueueSnapshot,
    QueueStats,
};
pub use observer::{QueueChange, QueueObserver, TracingObserver};

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// How [`QueueManager::enqueue`] treats a URL that is already queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Refuse a URL while a non-terminal job targets it.
    #[default]
    Reject,
    /// Accept every enqueue.
    Allow,
}

impl DuplicatePolicy {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Allow => "allow",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "allow" => Ok(Self::Allow),
            other => Err(format!(
                "invalid duplicate policy: {other} (expected reject or allow)"
            )),
        }
    }
}

/// What [`QueueManager::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and is now [`JobState::Cancelled`].
    Cancelled,
    /// The job is running or paused; its task will stop at the next checkpoint.
    Requested,
}

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
}

struct QueueInner {
    jobs: BTreeMap<JobId, JobEntry>,
    next_id: u64,
    next_seq: u64,
}

impl QueueInner {
    /// Orders a change among all others; taken under the lock with the mutation.
    fn stamp(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Changes waiting for their turn to reach the observer.
#[derive(Default)]
struct Delivery {
    pending: BTreeMap<u64, QueueChange>,
    next: u64,
    draining: bool,
}

/// Thread-safe owner of all job records.
pub struct QueueManager {
    inner: Mutex<QueueInner>,
    duplicate_policy: DuplicatePolicy,
    root_cancel: CancellationToken,
    observer: RwLock<Option<Arc<dyn QueueObserver>>>,
    delivery: Mutex<Delivery>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("duplicate_policy", &self.duplicate_policy)
            .field("jobs", &self.lock().jobs.len())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(duplicate_policy: DuplicatePolicy) -> Self {
        Self::with_cancel_root(duplicate_policy, CancellationToken::new())
    }

    /// Creates an empty queue whose per-job cancel tokens are children of `root`.
    ///
    /// Cancelling `root` requests cancellation of every job at once.
    #[must_use]
    pub fn with_cancel_root(duplicate_policy: DuplicatePolicy, root: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: BTreeMap::new(),
                next_id: 1,
                next_seq: 0,
            }),
            duplicate_policy,
            root_cancel: root,
            observer: RwLock::new(None),
            delivery: Mutex::new(Delivery::default()),
        }
    }

    /// Installs the change observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn QueueObserver>) {
        let mut slot = self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(observer);
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned queue mutex");
            poisoned.into_inner()
        })
    }

    fn delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands `change` to the observer once every earlier change has been.
    ///
    /// Whichever caller holds the next sequence number drains the backlog, so
    /// the observer runs on one thread at a time and never under a queue lock.
    fn publish(&self, seq: u64, change: QueueChange) {
        let mut delivery = self.delivery();
        delivery.pending.insert(seq, change);
        if delivery.draining {
            return;
        }
        delivery.draining = true;
        loop {
            let next = delivery.next;
            let Some(change) = delivery.pending.remove(&next) else {
                delivery.draining = false;
                return;
            };
            delivery.next += 1;
            drop(delivery);
            self.notify(&change);
            delivery = self.delivery();
        }
    }

    fn notify(&self, change: &QueueChange) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_change(change)));
            if delivered.is_err() {
                warn!("Queue observer panicked");
            }
        }
    }

    /// Adds a new job in [`JobState::Pending`].
    ///
    /// # Arguments
    ///
    /// * `source_url` - Chapter URL; surrounding whitespace is trimmed
    /// * `label` - Optional display label until the parser supplies one
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateJob`] if the policy is
    /// [`DuplicatePolicy::Reject`] and a non-terminal job targets the same URL.
    #[instrument(skip(self, label), fields(url = %source_url.trim()))]
    pub fn enqueue(&self, source_url: &str, label: Option<String>) -> Result<JobId> {
        let url = source_url.trim().to_string();
        let (seq, record) = {
            let mut inner = self.lock();
            if self.duplicate_policy == DuplicatePolicy::Reject {
                if let Some(existing) = inner
                    .jobs
                    .values()
                    .find(|entry| !entry.record.state.is_terminal() && entry.record.source_url == url)
                {
                    return Err(QueueError::DuplicateJob {
                        url,
                        existing: existing.record.id,
                    });
                }
            }

            let id = JobId(inner.next_id);
            inner.next_id += 1;
            let record = JobRecord::new(id, url, label);
            inner.jobs.insert(
                id,
                JobEntry {
                    record: record.clone(),
                    cancel: self.root_cancel.child_token(),
                },
            );
            (inner.stamp(), record)
        };

        let id = record.id;
        debug!(job_id = %id, "enqueued");
        self.publish(seq, QueueChange::Enqueued(record));
        Ok(id)
    }

    /// Returns a consistent copy of every record, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let jobs: Vec<JobRecord> = self
            .lock()
            .jobs
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        QueueSnapshot::new(jobs)
    }

    /// Returns a copy of one record.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.lock().jobs.get(&id).map(|entry| entry.record.clone())
    }

    /// Returns the current state of a job.
    #[must_use]
    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.lock().jobs.get(&id).map(|entry| entry.record.state)
    }

    /// Atomically moves a job from one of `from` to `to`, applying `patch`.
    ///
    /// Timestamps are stamped here: `started_at` on the first entry to
    /// [`JobState::Running`], `finished_at` on entry to a terminal state.
    ///
    /// # Errors
    ///
    /// - [`QueueError::JobNotFound`] if the id is unknown
    /// - [`QueueError::InvalidTransition`] if the current state is not in
    ///   `from` or `current -> to` is not an edge of the state machine
    /// - [`QueueError::TotalBelowProgress`] if `patch.total` is below the
    ///   pages already recorded
    pub fn transition(
        &self,
        id: JobId,
        from: &[JobState],
        to: JobState,
        patch: JobPatch,
    ) -> Result<JobRecord> {
        let (seq, previous, record) = {
            let mut inner = self.lock();
            let entry = inner.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
            let current = entry.record.state;
            if !from.contains(&current) || !current.can_transition_to(to) {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: current,
                    to,
                });
            }
            check_total(&entry.record, &patch)?;
            entry.record.apply(to, patch);
            let record = entry.record.clone();
            (inner.stamp(), current, record)
        };

        debug!(job_id = %id, from = %previous, to = %to, "transition");
        self.publish(
            seq,
            QueueChange::StateChanged {
                from: previous,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    /// Applies `patch` to a running or paused job without changing its state.
    ///
    /// Used once the parser has resolved a chapter to publish its page total,
    /// label and download directory.
    ///
    /// # Errors
    ///
    /// - [`QueueError::JobNotFound`] if the id is unknown
    /// - [`QueueError::InvalidTransition`] if the job is not running or paused
    /// - [`QueueError::TotalBelowProgress`] if `patch.total` is below the
    ///   pages already recorded
    pub fn update(&self, id: JobId, patch: JobPatch) -> Result<JobRecord> {
        let (seq, record) = {
            let mut inner = self.lock();
            let entry = inner.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
            let state = entry.record.state;
            if !matches!(state, JobState::Running | JobState::Paused) {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: state,
                    to: state,
                });
            }
            check_total(&entry.record, &patch)?;
            entry.record.apply(state, patch);
            let record = entry.record.clone();
            (inner.stamp(), record)
        };

        self.publish(seq, QueueChange::Updated(record.clone()));
        Ok(record)
    }

    /// Records one more stored page for a running or paused job.
    ///
    /// # Errors
    ///
    /// - [`QueueError::JobNotFound`] if the id is unknown
    /// - [`QueueError::InvalidTransition`] if the job is not running or paused
    /// - [`QueueError::ProgressOverflow`] if `completed` already equals `total`
    pub fn record_progress(&self, id: JobId) -> Result<Progress> {
        let (seq, progress) = {
            let mut inner = self.lock();
            let entry = inner.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
            let record = &mut entry.record;
            if !matches!(record.state, JobState::Running | JobState::Paused) {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: record.state,
                    to: record.state,
                });
            }
            if record.progress.completed >= record.progress.total {
                return Err(QueueError::ProgressOverflow {
                    id,
                    completed: record.progress.completed,
                    total: record.progress.total,
                });
            }
            record.progress.completed += 1;
            let progress = record.progress;
            (inner.stamp(), progress)
        };

        self.publish(seq, QueueChange::Progress { id, progress });
        Ok(progress)
    }

    /// Cancels a job.
    ///
    /// A pending job becomes [`JobState::Cancelled`] immediately. A running or
    /// paused job has its cancel token triggered; its task reports
    /// [`JobState::Cancelled`] once it reaches a checkpoint.
    ///
    /// # Errors
    ///
    /// - [`QueueError::JobNotFound`] if the id is unknown
    /// - [`QueueError::InvalidTransition`] if the job is already terminal
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let change = {
            let mut inner = self.lock();
            let entry = inner.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
            match entry.record.state {
                JobState::Pending => {
                    entry.cancel.cancel();
                    entry.record.apply(JobState::Cancelled, JobPatch::default());
                    let record = entry.record.clone();
                    Some((inner.stamp(), record))
                }
                JobState::Running | JobState::Paused => {
                    entry.cancel.cancel();
                    None
                }
                state => {
                    return Err(QueueError::InvalidTransition {
                        id,
                        from: state,
                        to: JobState::Cancelled,
                    });
                }
            }
        };

        match change {
            Some((seq, record)) => {
                debug!("pending job cancelled");
                self.publish(
                    seq,
                    QueueChange::StateChanged {
                        from: JobState::Pending,
                        record,
                    },
                );
                Ok(CancelOutcome::Cancelled)
            }
            None => {
                debug!("cancellation requested");
                Ok(CancelOutcome::Requested)
            }
        }
    }

    /// Returns true once cancellation has been requested for a job.
    ///
    /// Unknown ids report `false`.
    #[must_use]
    pub fn is_cancel_requested(&self, id: JobId) -> bool {
        self.lock()
            .jobs
            .get(&id)
            .is_some_and(|entry| entry.cancel.is_cancelled())
    }

    /// Returns the cancel token a job task observes at its checkpoints.
    #[must_use]
    pub fn cancel_token(&self, id: JobId) -> Option<CancellationToken> {
        self.lock().jobs.get(&id).map(|entry| entry.cancel.clone())
    }

    /// Ids of every job that is not yet terminal, in id order.
    #[must_use]
    pub fn unfinished_ids(&self) -> Vec<JobId> {
        self.lock()
            .jobs
            .values()
            .filter(|entry| !entry.record.state.is_terminal())
            .map(|entry| entry.record.id)
            .collect()
    }

    /// Removes every terminal record matching `predicate`.
    ///
    /// Returns the number of removed records.
    pub fn clear<P>(&self, predicate: P) -> usize
    where
        P: Fn(&JobRecord) -> bool,
    {
        let (seq, removed) = {
            let mut inner = self.lock();
            let ids: Vec<JobId> = inner
                .jobs
                .values()
                .filter(|entry| entry.record.state.is_terminal() && predicate(&entry.record))
                .map(|entry| entry.record.id)
                .collect();
            for id in &ids {
                inner.jobs.remove(id);
            }
            let seq = (!ids.is_empty()).then(|| inner.stamp());
            (seq, ids)
        };

        let count = removed.len();
        if let Some(seq) = seq {
            self.publish(seq, QueueChange::Removed(removed));
        }
        count
    }

    /// Removes a single terminal record.
    ///
    /// # Errors
    ///
    /// - [`QueueError::JobNotFound`] if the id is unknown
    /// - [`QueueError::InvalidTransition`] if the job is not terminal
    pub fn remove(&self, id: JobId) -> Result<JobRecord> {
        let (seq, record) = {
            let mut inner = self.lock();
            let state = inner
                .jobs
                .get(&id)
                .map(|entry| entry.record.state)
                .ok_or(QueueError::JobNotFound(id))?;
            if !state.is_terminal() {
                return Err(QueueError::InvalidTransition {
                    id,
                    from: state,
                    to: state,
                });
            }
            let record = inner
                .jobs
                .remove(&id)
                .map(|entry| entry.record)
                .ok_or(QueueError::JobNotFound(id))?;
            (inner.stamp(), record)
        };

        self.publish(seq, QueueChange::Removed(vec![id]));
        Ok(record)
    }
}

/// Progress never goes backwards, so a new total may not undercut it.
fn check_total(record: &JobRecord, patch: &JobPatch) -> Result<()> {
    match patch.total {
        Some(total) if total < record.progress.completed => Err(QueueError::TotalBelowProgress {
            id: record.id,
            completed: record.progress.completed,
            total,
        }),
        _ => Ok(()),
    }
}
