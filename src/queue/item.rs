//! Job record types and state definitions.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier of a job, assigned monotonically by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a job worker.
    Pending,
    /// A job task is driving this job.
    Running,
    /// The task is parked at the global pause gate.
    Paused,
    /// Finished and produced its outputs.
    Success,
    /// Finished with an error.
    Error,
    /// Cancelled before completion.
    Cancelled,
}

impl JobState {
    /// All states, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Success,
        Self::Error,
        Self::Cancelled,
    ];

    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for states with no outgoing edges.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Returns true if `self -> to` is an edge of the job state machine.
    ///
    /// ```text
    /// Pending -> Running | Cancelled
    /// Running -> Paused | Success | Error | Cancelled
    /// Paused  -> Running | Cancelled | Error
    /// ```
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use JobState::{Cancelled, Error, Paused, Pending, Running, Success};
        matches!(
            (self, to),
            (Pending, Running | Cancelled)
                | (Running, Paused | Success | Error | Cancelled)
                | (Paused, Running | Cancelled | Error)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("invalid job state: {s}"))
    }
}

/// Page counters for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Number of resources the parser returned (0 until resolved).
    pub total: usize,
    /// Number of resources stored so far. Never exceeds `total`.
    pub completed: usize,
}

impl Progress {
    /// Completed fraction in `[0.0, 1.0]`; 0 when nothing is known yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Classification of why a job ended in [`JobState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure that survived every retry.
    TransientNetwork,
    /// Upstream rejected the request or returned unusable content.
    UpstreamRejected,
    /// No enabled parser accepts the job's URL.
    NoParserAvailable,
    /// The upstream's circuit stayed open through every retry.
    CircuitOpen,
    /// No rate-limit token became available in time.
    RateLimitTimeout,
    /// The job's own state reporting was rejected by the queue.
    InvalidTransition,
    /// A plugin panicked or failed internally.
    PluginInternal,
    /// Writing pages or outputs to local disk failed.
    LocalIo,
}

impl ErrorKind {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::UpstreamRejected => "upstream_rejected",
            Self::NoParserAvailable => "no_parser_available",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimitTimeout => "rate_limit_timeout",
            Self::InvalidTransition => "invalid_transition",
            Self::PluginInternal => "plugin_internal",
            Self::LocalIo => "local_io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error attached to a job in [`JobState::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl ErrorDetail {
    /// Creates a new error detail.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A job as owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier.
    pub id: JobId,
    /// The chapter URL handed to the parser.
    pub source_url: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Page counters.
    pub progress: Progress,
    /// Error detail, only present in [`JobState::Error`].
    pub error: Option<ErrorDetail>,
    /// Display label; replaced by `"<title> - <chapter>"` once resolved.
    pub label: Option<String>,
    /// Files produced by converters.
    pub outputs: Vec<PathBuf>,
    /// Directory the pages are written to, once known.
    pub download_dir: Option<PathBuf>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the job first entered [`JobState::Running`].
    pub started_at: Option<DateTime<Utc>>,
    /// When the job entered a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, source_url: String, label: Option<String>) -> Self {
        Self {
            id,
            source_url,
            state: JobState::Pending,
            progress: Progress::default(),
            error: None,
            label,
            outputs: Vec::new(),
            download_dir: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Label if set, otherwise the source URL.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.source_url)
    }

    /// Applies a patch and stamps timestamps for the new state.
    pub(crate) fn apply(&mut self, to: JobState, patch: JobPatch) {
        self.state = to;
        if let Some(total) = patch.total {
            self.progress.total = total;
        }
        if let Some(label) = patch.label {
            self.label = Some(label);
        }
        if let Some(dir) = patch.download_dir {
            self.download_dir = Some(dir);
        }
        if let Some(outputs) = patch.outputs {
            self.outputs = outputs;
        }
        if to == JobState::Error {
            self.error = patch.error;
        }

        let now = Utc::now();
        if to == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }
}

impl fmt::Display for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job {{ id: {}, url: {}, state: {} }}",
            self.id, self.source_url, self.state
        )
    }
}

/// Fields a transition may update alongside the state change.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// New resource total.
    pub total: Option<usize>,
    /// New display label.
    pub label: Option<String>,
    /// Directory pages are written to.
    pub download_dir: Option<PathBuf>,
    /// Converter outputs.
    pub outputs: Option<Vec<PathBuf>>,
    /// Error detail; only applied when transitioning to [`JobState::Error`].
    pub error: Option<ErrorDetail>,
}

impl JobPatch {
    /// Patch carrying only an error detail.
    #[must_use]
    pub fn error(detail: ErrorDetail) -> Self {
        Self {
            error: Some(detail),
            ..Self::default()
        }
    }

    /// Patch carrying only converter outputs.
    #[must_use]
    pub fn outputs(outputs: Vec<PathBuf>) -> Self {
        Self {
            outputs: Some(outputs),
            ..Self::default()
        }
    }
}

/// Per-state counts derived from a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// All records.
    pub total: usize,
    /// Records in [`JobState::Pending`].
    pub pending: usize,
    /// Records in [`JobState::Running`].
    pub active: usize,
    /// Records in [`JobState::Paused`].
    pub paused: usize,
    /// Records in [`JobState::Success`].
    pub completed: usize,
    /// Records in [`JobState::Error`].
    pub failed: usize,
    /// Records in [`JobState::Cancelled`].
    pub cancelled: usize,
}

impl QueueStats {
    pub(crate) fn from_records(records: &[JobRecord]) -> Self {
        let mut stats = Self {
            total: records.len(),
            ..Self::default()
        };
        for record in records {
            match record.state {
                JobState::Pending => stats.pending += 1,
                JobState::Running => stats.active += 1,
                JobState::Paused => stats.paused += 1,
                JobState::Success => stats.completed += 1,
                JobState::Error => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Returns true when no job is pending, running or paused.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending + self.active + self.paused == 0
    }
}

/// Immutable point-in-time copy of every job record, ordered by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Records ordered by id.
    pub jobs: Vec<JobRecord>,
    /// Counts computed from `jobs`.
    pub stats: QueueStats,
}

impl QueueSnapshot {
    pub(crate) fn new(jobs: Vec<JobRecord>) -> Self {
        let stats = QueueStats::from_records(&jobs);
        Self { jobs, stats }
    }

    /// Looks up a record by id.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs
            .binary_search_by_key(&id, |record| record.id)
            .ok()
            .map(|index| &self.jobs[index])
    }
}
