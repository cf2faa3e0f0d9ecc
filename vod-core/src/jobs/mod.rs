mod queue;
mod store;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use queue::{CancelOutcome, JobContext, JobHandler, JobQueue, ProgressWriter};
pub use store::{SqliteJobStore, SqliteJobStoreBuilder};

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("failed to open job database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on job database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("job database path not configured")]
    MissingStore,
    #[error("invalid job state: {0}")]
    InvalidState(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("asset {0} already has a job in flight")]
    AssetBusy(String),
    #[error("job payload could not be serialized: {0}")]
    Payload(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Retrying,
    Completed,
    Dead,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Retrying => "retrying",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Dead | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "dead" => Ok(Self::Dead),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobQueueError::InvalidState(other.to_string())),
        }
    }
}

/// Closed payload for the content-vs-episode distinction; episodes keep the
/// owning content id for output-path and collision accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTarget {
    Content { content_id: String },
    Episode { episode_id: String, content_id: String },
}

impl JobTarget {
    /// The asset whose processing fields this job owns.
    pub fn asset_id(&self) -> &str {
        match self {
            JobTarget::Content { content_id } => content_id,
            JobTarget::Episode { episode_id, .. } => episode_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub target: JobTarget,
    pub source_key: String,
    pub output_base_path: String,
    pub requested_qualities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub delay: Option<chrono::Duration>,
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub stage: String,
    pub percent: u8,
    pub current_quality: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSuccess {
    pub manifest_path: String,
    pub available_qualities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    InvalidSource,
    TransientIo,
    Encode,
    Publish,
    Finalize,
    Cancelled,
    Exhausted,
    Internal,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::InvalidSource => "invalid_source",
            JobErrorKind::TransientIo => "transient_io",
            JobErrorKind::Encode => "encode",
            JobErrorKind::Publish => "publish",
            JobErrorKind::Finalize => "finalize",
            JobErrorKind::Cancelled => "cancelled",
            JobErrorKind::Exhausted => "exhausted",
            JobErrorKind::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invalid_source" => Some(Self::InvalidSource),
            "transient_io" => Some(Self::TransientIo),
            "encode" => Some(Self::Encode),
            "publish" => Some(Self::Publish),
            "finalize" => Some(Self::Finalize),
            "cancelled" => Some(Self::Cancelled),
            "exhausted" => Some(Self::Exhausted),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobErrorKind::TransientIo
                | JobErrorKind::Encode
                | JobErrorKind::Publish
                | JobErrorKind::Finalize
        )
    }
}

/// Handler-facing failure: the kind drives retry classification, the detail
/// is already redacted and safe to persist.
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub kind: JobErrorKind,
    pub detail: String,
}

impl JobFailure {
    pub fn new(kind: JobErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub asset_id: String,
    pub target: JobTarget,
    pub source_key: String,
    pub output_base_path: String,
    pub requested_qualities: Vec<String>,
    pub priority: i64,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub manifest_path: Option<String>,
    pub produced_qualities: Vec<String>,
    pub error_kind: Option<JobErrorKind>,
    pub error_detail: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}
