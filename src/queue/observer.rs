//! Change notifications emitted by the queue.

use super::item::{JobId, JobRecord, JobState, Progress};

/// A single successful queue mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueChange {
    /// A new job was enqueued.
    Enqueued(JobRecord),
    /// A job changed state. `record` is the state after the change.
    StateChanged {
        /// Previous state.
        from: JobState,
        /// Record after the change.
        record: JobRecord,
    },
    /// A running or paused job's details changed without a state change.
    Updated(JobRecord),
    /// A page finished for a job.
    Progress {
        /// Job id.
        id: JobId,
        /// Counters after the increment.
        progress: Progress,
    },
    /// Terminal records were removed.
    Removed(Vec<JobId>),
}

/// Receives queue changes.
///
/// Changes arrive one at a time in the order the mutations happened, outside
/// the queue lock. A change may be delivered on another mutating thread than
/// its own, so implementations must be cheap and must not block.
pub trait QueueObserver: Send + Sync {
    fn on_change(&self, change: &QueueChange) {
        let _ = change;
    }
}

/// Observer that logs every change through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    fn on_change(&self, change: &QueueChange) {
        match change {
            QueueChange::Enqueued(record) => {
                tracing::info!(job_id = %record.id, url = %record.source_url, "Job enqueued");
            }
            QueueChange::StateChanged { from, record } => {
                if let Some(error) = &record.error {
                    tracing::warn!(
                        job_id = %record.id,
                        %from,
                        to = %record.state,
                        error = %error,
                        "Job failed"
                    );
                } else {
                    tracing::info!(
                        job_id = %record.id,
                        %from,
                        to = %record.state,
                        label = record.display_name(),
                        "Job state changed"
                    );
                }
            }
            QueueChange::Updated(record) => {
                tracing::debug!(
                    job_id = %record.id,
                    total = record.progress.total,
                    label = record.display_name(),
                    "Job resolved"
                );
            }
            QueueChange::Progress { id, progress } => {
                tracing::debug!(
                    job_id = %id,
                    completed = progress.completed,
                    total = progress.total,
                    "Page stored"
                );
            }
            QueueChange::Removed(ids) => {
                tracing::debug!(count = ids.len(), "Jobs removed");
            }
        }
    }
}
