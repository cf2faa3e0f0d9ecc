mod fs;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use fs::FsObjectStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("multipart upload not found: {0}")]
    UploadNotFound(String),
    #[error("invalid part {part_number} for upload {upload_ref}: {reason}")]
    InvalidPart {
        upload_ref: String,
        part_number: u32,
        reason: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("transient storage error: {0}")]
    Transient(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Io { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
}

/// Cache policy attached to published objects. Segments never change once
/// written; manifests must be revalidated quickly after a republish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    ImmutableSegment,
    ShortManifest,
    Source,
}

impl CachePolicy {
    pub fn header_value(&self) -> &'static str {
        match self {
            CachePolicy::ImmutableSegment => "max-age=31536000, immutable",
            CachePolicy::ShortManifest => "max-age=60",
            CachePolicy::Source => "max-age=3600",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartReceipt {
    pub part_number: u32,
    pub checksum: String,
}

/// Bucket/key object storage as seen by this core. Implementations are thin:
/// the production deployment wraps the platform object store, `FsObjectStore`
/// backs tests and single-node installs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens a multipart upload for `key`, returning an opaque upload ref.
    async fn create_multipart(&self, key: &str, content_type: &str) -> StorageResult<String>;

    /// Stores one part. Re-putting the same part number overwrites it.
    async fn put_part(
        &self,
        upload_ref: &str,
        part_number: u32,
        data: &[u8],
    ) -> StorageResult<PartReceipt>;

    /// Composes the named parts into the final object, in part order.
    async fn complete_multipart(
        &self,
        upload_ref: &str,
        parts: &[PartReceipt],
    ) -> StorageResult<ObjectMeta>;

    /// Releases multipart state. Safe to call when nothing is pending.
    async fn abort_multipart(&self, upload_ref: &str) -> StorageResult<()>;

    /// Streams the object into `destination`, returning the byte count.
    async fn get_object(&self, key: &str, destination: &Path) -> StorageResult<u64>;

    async fn put_object(
        &self,
        key: &str,
        source: &Path,
        content_type: &str,
        cache: CachePolicy,
    ) -> StorageResult<()>;

    async fn head_object(&self, key: &str) -> StorageResult<ObjectMeta>;
}
