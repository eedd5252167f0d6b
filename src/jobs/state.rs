//! Job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is waiting to be picked up.
    Pending,
    /// Job is being worked on.
    Running,
    /// Job finished and produced a result.
    Succeeded,
    /// Job failed and will not be retried.
    Failed,
    /// Job was cancelled.
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        if *self == target {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) |
            // From Running
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Pending => "⏳",
            Self::Running => "🔄",
            Self::Succeeded => "✅",
            Self::Failed => "❌",
            Self::Cancelled => "⛔",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ThematicAnalysis,
    JobStatusCheck,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ThematicAnalysis => "thematic_analysis",
            Self::JobStatusCheck => "job_status_check",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a tracked job.
///
/// Owned by [`JobRegistry`](crate::jobs::JobRegistry); callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// Unique job ID (`job_` + 12 hex chars).
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// What the job does.
    pub task_type: TaskType,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Progress estimate in [0, 1].
    pub progress: f64,
    /// Final workflow state, set on success.
    pub result: Option<Value>,
    /// Failure message, set on failure.
    pub error: Option<String>,
    /// Caller-supplied metadata.
    pub metadata: Map<String, Value>,
}

impl JobState {
    pub(crate) fn new(job_id: String, task_type: TaskType, metadata: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Pending,
            task_type,
            created_at: now,
            updated_at: now,
            progress: 0.0,
            result: None,
            error: None,
            metadata,
        }
    }

    /// Merge a partial update into this state.
    ///
    /// Progress is clamped to [0, 1] and never moves backwards. A status the
    /// state machine does not allow is dropped with a warning; the remaining
    /// fields still apply.
    pub(crate) fn apply(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            if self.status.can_transition_to(status) {
                self.status = status;
            } else {
                tracing::warn!(
                    job_id = %self.job_id,
                    from = %self.status,
                    to = %status,
                    "Ignoring invalid job status transition"
                );
            }
        }
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 1.0).max(self.progress);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(metadata) = update.metadata {
            self.metadata.extend(metadata);
        }
        self.updated_at = Utc::now();
    }
}

/// Typed partial update for a [`JobState`].
///
/// The set of updatable fields is closed: identity and timestamps are managed
/// by the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Entries merged into the existing metadata map.
    pub metadata: Option<Map<String, Value>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
