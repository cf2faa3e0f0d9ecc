use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::jobs::{JobErrorKind, JobFailure};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("encode failed for {rung}: {detail}")]
    Encode { rung: String, detail: String },
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("finalize failed: {0}")]
    Finalize(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("job cancelled")]
    Cancelled,
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

impl TranscodeError {
    pub fn kind(&self) -> JobErrorKind {
        match self {
            TranscodeError::InvalidSource(_) => JobErrorKind::InvalidSource,
            TranscodeError::Download(_) => JobErrorKind::TransientIo,
            TranscodeError::Encode { .. } => JobErrorKind::Encode,
            TranscodeError::Publish(_) => JobErrorKind::Publish,
            TranscodeError::Finalize(_) => JobErrorKind::Finalize,
            TranscodeError::Io { .. } => JobErrorKind::Internal,
            TranscodeError::Cancelled => JobErrorKind::Cancelled,
        }
    }

    /// Operator- and viewer-safe summary. Tool output never leaves the
    /// internal failure log.
    pub fn user_message(&self) -> String {
        match self {
            TranscodeError::InvalidSource(_) => {
                "source file could not be read as a supported video".to_string()
            }
            TranscodeError::Download(_) => "failed to fetch the source from storage".to_string(),
            TranscodeError::Encode { rung, .. } => format!("encoding the {rung} variant failed"),
            TranscodeError::Publish(_) => "failed to publish streaming outputs".to_string(),
            TranscodeError::Finalize(_) => "failed to record the processing result".to_string(),
            TranscodeError::Io { .. } => "internal processing error".to_string(),
            TranscodeError::Cancelled => "processing was cancelled".to_string(),
        }
    }
}

impl From<TranscodeError> for JobFailure {
    fn from(error: TranscodeError) -> Self {
        JobFailure::new(error.kind(), error.user_message())
    }
}

impl From<StorageError> for TranscodeError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(key) => {
                TranscodeError::InvalidSource(format!("source object {key} missing"))
            }
            other => TranscodeError::Download(other.to_string()),
        }
    }
}

impl From<CatalogError> for TranscodeError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::NotFound(asset) => {
                TranscodeError::InvalidSource(format!("asset {asset} is not registered"))
            }
            other => TranscodeError::Finalize(other.to_string()),
        }
    }
}
