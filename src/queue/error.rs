//! Error types for queue operations.

use thiserror::Error;

use super::item::{JobId, JobState};

/// Errors that can occur during queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A non-terminal job already targets this URL.
    #[error(
        "job {existing} already targets {url}\n  Suggestion: Wait for it to finish or cancel it first"
    )]
    DuplicateJob {
        /// The (trimmed) URL.
        url: String,
        /// The job that already owns it.
        existing: JobId,
    },

    /// The requested state change is not allowed from the job's current state.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        /// Job id.
        id: JobId,
        /// State the job was actually in.
        from: JobState,
        /// Requested target state.
        to: JobState,
    },

    /// Job not found.
    #[error(
        "job not found: {0}\n  Suggestion: The job may have been cleared or the ID is incorrect"
    )]
    JobNotFound(JobId),

    /// Progress would exceed the job's resource total.
    #[error("progress overflow for job {id}: {completed} of {total} already recorded")]
    ProgressOverflow {
        /// Job id.
        id: JobId,
        /// Completed count before the rejected increment.
        completed: usize,
        /// Resource total.
        total: usize,
    },

    /// A new resource total is below the pages already recorded.
    #[error("job {id} already has {completed} pages recorded, cannot lower total to {total}")]
    TotalBelowProgress {
        /// Job id.
        id: JobId,
        /// Completed count at the time of the patch.
        completed: usize,
        /// Rejected total.
        total: usize,
    },
}

impl QueueError {
    /// Returns true if the job was concurrently moved to a terminal state.
    ///
    /// Job tasks use this to tell an expected cancellation race apart from a
    /// broken state discipline.
    #[must_use]
    pub fn is_terminal_race(&self) -> bool {
        matches!(self, Self::InvalidTransition { from, .. } if from.is_terminal())
    }
}
