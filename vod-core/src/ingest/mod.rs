mod store;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{LimitsSection, PipelineConfig};
use crate::jobs::{
    EnqueueOptions, JobQueueError, JobRecord, JobSpec, JobTarget, SqliteJobStore,
};
use crate::storage::{ObjectStore, PartReceipt, StorageError};

pub use store::{SqliteSessionStore, SqliteSessionStoreBuilder};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to open session database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on session database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("session database path not configured")]
    MissingStore,
    #[error("invalid upload session status: {0}")]
    InvalidStatus(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("upload session not found: {0}")]
    NotFound(String),
    #[error("upload incomplete, missing parts {missing:?}")]
    IncompleteParts { missing: Vec<u32> },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("queue error: {0}")]
    Queue(#[from] JobQueueError),
}

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uploading,
    Completed,
    Aborted,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Uploading)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            "failed" => Ok(Self::Failed),
            other => Err(IngestError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub session_id: String,
    pub target: JobTarget,
    pub object_key: String,
    pub upload_ref: String,
    pub total_size: u64,
    pub part_size: u64,
    pub expected_parts: u32,
    pub content_type: String,
    pub status: SessionStatus,
    pub uploaded_parts: Vec<UploadedPart>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Part numbers in `[1, expected_parts]` not yet acknowledged.
    pub fn missing_parts(&self) -> Vec<u32> {
        let acked: std::collections::HashSet<u32> = self
            .uploaded_parts
            .iter()
            .map(|part| part.part_number)
            .collect();
        (1..=self.expected_parts)
            .filter(|number| !acked.contains(number))
            .collect()
    }
}

/// Handle the client uses to push one part directly to object storage.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPartHandle {
    pub part_number: u32,
    pub upload_ref: String,
}

#[derive(Debug, Clone)]
pub struct BeginUploadOutcome {
    pub session: UploadSession,
    pub part_handles: Vec<UploadPartHandle>,
}

/// Owns the chunked-upload lifecycle: session creation, part bookkeeping,
/// storage-side compose on finalize, and the enqueue side effect that hands
/// the finished object to the transcode queue.
pub struct IngestCoordinator {
    sessions: SqliteSessionStore,
    storage: Arc<dyn ObjectStore>,
    jobs: SqliteJobStore,
    limits: LimitsSection,
    pipeline: PipelineConfig,
}

impl IngestCoordinator {
    pub fn new(
        sessions: SqliteSessionStore,
        storage: Arc<dyn ObjectStore>,
        jobs: SqliteJobStore,
        limits: LimitsSection,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            sessions,
            storage,
            jobs,
            limits,
            pipeline,
        }
    }

    pub async fn begin_upload(
        &self,
        target: JobTarget,
        object_key: &str,
        total_size: u64,
        content_type: &str,
        part_size_hint: Option<u64>,
    ) -> IngestResult<BeginUploadOutcome> {
        if total_size == 0 {
            return Err(IngestError::Validation("total size must be non-zero".into()));
        }
        if total_size > self.limits.max_upload_bytes {
            return Err(IngestError::Validation(format!(
                "total size {total_size} exceeds platform maximum {}",
                self.limits.max_upload_bytes
            )));
        }
        if !self
            .pipeline
            .ingest
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
        {
            return Err(IngestError::Validation(format!(
                "content type {content_type} is not an accepted video format"
            )));
        }

        let part_size = part_size_hint
            .unwrap_or(self.pipeline.ingest.default_part_bytes)
            .clamp(self.limits.min_part_bytes, self.limits.max_part_bytes);
        let expected_parts = total_size.div_ceil(part_size) as u32;

        let upload_ref = self.storage.create_multipart(object_key, content_type).await?;
        let session = UploadSession {
            session_id: format!("up-{}", Uuid::new_v4().simple()),
            target,
            object_key: object_key.to_string(),
            upload_ref: upload_ref.clone(),
            total_size,
            part_size,
            expected_parts,
            content_type: content_type.to_string(),
            status: SessionStatus::Uploading,
            uploaded_parts: Vec::new(),
            created_at: None,
            updated_at: None,
        };
        self.sessions.create_session(&session)?;

        let part_handles = (1..=expected_parts)
            .map(|part_number| UploadPartHandle {
                part_number,
                upload_ref: upload_ref.clone(),
            })
            .collect();

        info!(
            session_id = %session.session_id,
            object_key,
            expected_parts,
            "upload session opened"
        );
        Ok(BeginUploadOutcome {
            session,
            part_handles,
        })
    }

    /// Idempotent: re-acknowledging a part number overwrites the prior
    /// checksum, so a client may retry an individual part upload.
    pub async fn acknowledge_part(
        &self,
        session_id: &str,
        part_number: u32,
        checksum: &str,
    ) -> IngestResult<()> {
        let session = self
            .sessions
            .fetch(session_id)?
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(IngestError::Validation(format!(
                "session {session_id} is {} and no longer accepts parts",
                session.status
            )));
        }
        if part_number == 0 || part_number > session.expected_parts {
            return Err(IngestError::Validation(format!(
                "part number {part_number} outside [1, {}]",
                session.expected_parts
            )));
        }
        self.sessions.upsert_part(session_id, part_number, checksum)?;
        Ok(())
    }

    /// Verifies the full part set, composes the object, and enqueues the
    /// transcode job. A missing part leaves the session `uploading` so the
    /// client can resume.
    pub async fn finalize_upload(&self, session_id: &str) -> IngestResult<String> {
        let session = self
            .sessions
            .fetch(session_id)?
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))?;

        match session.status {
            SessionStatus::Completed => return Ok(session.object_key),
            SessionStatus::Uploading => {}
            other => {
                return Err(IngestError::Validation(format!(
                    "session {session_id} is {other} and cannot be finalized"
                )))
            }
        }

        let missing = session.missing_parts();
        if !missing.is_empty() {
            return Err(IngestError::IncompleteParts { missing });
        }

        let receipts: Vec<PartReceipt> = session
            .uploaded_parts
            .iter()
            .map(|part| PartReceipt {
                part_number: part.part_number,
                checksum: part.checksum.clone(),
            })
            .collect();
        self.storage
            .complete_multipart(&session.upload_ref, &receipts)
            .await?;
        self.sessions
            .mark_status(session_id, SessionStatus::Completed)?;

        let job = self.enqueue_transcode(&session)?;
        info!(
            session_id,
            object_key = %session.object_key,
            job_id = %job.job_id,
            "upload finalized and transcode queued"
        );
        Ok(session.object_key)
    }

    /// Safe on already-finalized or already-aborted sessions.
    pub async fn abort_upload(&self, session_id: &str) -> IngestResult<()> {
        let session = self
            .sessions
            .fetch(session_id)?
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Ok(());
        }
        self.storage.abort_multipart(&session.upload_ref).await?;
        self.sessions
            .mark_status(session_id, SessionStatus::Aborted)?;
        info!(session_id, "upload session aborted");
        Ok(())
    }

    pub fn session_status(&self, session_id: &str) -> IngestResult<UploadSession> {
        self.sessions
            .fetch(session_id)?
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))
    }

    /// Reclaims sessions with no client activity inside the TTL window.
    pub async fn sweep_expired(&self, ttl: Duration) -> IngestResult<usize> {
        let cutoff = Utc::now() - ttl;
        let stale = self.sessions.list_stale(cutoff, 100)?;
        let mut reclaimed = 0;
        for session in stale {
            if let Err(error) = self.storage.abort_multipart(&session.upload_ref).await {
                warn!(
                    session_id = %session.session_id,
                    %error,
                    "failed to release storage state for stale session"
                );
            }
            self.sessions
                .mark_status(&session.session_id, SessionStatus::Failed)?;
            reclaimed += 1;
        }
        if reclaimed > 0 {
            info!(reclaimed, "stale upload sessions reclaimed");
        }
        Ok(reclaimed)
    }

    fn enqueue_transcode(&self, session: &UploadSession) -> IngestResult<JobRecord> {
        let asset_id = session.target.asset_id();
        let spec = JobSpec {
            target: session.target.clone(),
            source_key: session.object_key.clone(),
            output_base_path: format!("videos/{asset_id}/hls"),
            requested_qualities: self
                .pipeline
                .transcode
                .rungs
                .iter()
                .map(|rung| rung.name.clone())
                .collect(),
        };
        let options = EnqueueOptions {
            max_attempts: self.pipeline.queue.max_attempts,
            ..EnqueueOptions::default()
        };
        Ok(self.jobs.enqueue(&spec, &options)?)
    }
}
