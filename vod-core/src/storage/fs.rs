use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::{CachePolicy, ObjectMeta, ObjectStore, PartReceipt, StorageError, StorageResult};

const MULTIPART_DIR: &str = ".multipart";
const META_DIR: &str = ".meta";

#[derive(Debug, Serialize, Deserialize)]
struct UploadManifest {
    key: String,
    content_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    content_type: String,
    cache_control: String,
    size: u64,
}

/// Filesystem-backed object store. Objects live under a bucket root keyed by
/// their object key; multipart state is staged under `.multipart/<ref>/` and
/// composed on complete.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn upload_dir(&self, upload_ref: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_ref)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn part_file(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part_{part_number:05}"))
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        Ok(())
    }

    async fn read_manifest(&self, upload_ref: &str) -> StorageResult<UploadManifest> {
        let path = self.upload_dir(upload_ref).join("upload.json");
        let bytes = fs::read(&path)
            .await
            .map_err(|_| StorageError::UploadNotFound(upload_ref.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| StorageError::Transient(format!("corrupt upload manifest: {err}")))
    }

    async fn write_meta(
        &self,
        key: &str,
        content_type: &str,
        cache: CachePolicy,
        size: u64,
    ) -> StorageResult<()> {
        let meta = StoredMeta {
            content_type: content_type.to_string(),
            cache_control: cache.header_value().to_string(),
            size,
        };
        let path = self.meta_path(key);
        Self::ensure_parent(&path).await?;
        let bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|err| StorageError::Transient(err.to_string()))?;
        fs::write(&path, bytes)
            .await
            .map_err(|source| StorageError::Io { source, path })?;
        Ok(())
    }

    pub fn cached_meta(&self, key: &str) -> Option<(String, String)> {
        let bytes = std::fs::read(self.meta_path(key)).ok()?;
        let meta: StoredMeta = serde_json::from_slice(&bytes).ok()?;
        Some((meta.content_type, meta.cache_control))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn create_multipart(&self, key: &str, content_type: &str) -> StorageResult<String> {
        let upload_ref = format!("mpu-{}", Uuid::new_v4().simple());
        let dir = self.upload_dir(&upload_ref);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: dir.clone(),
            })?;
        let manifest = UploadManifest {
            key: key.to_string(),
            content_type: content_type.to_string(),
        };
        let manifest_path = dir.join("upload.json");
        let bytes = serde_json::to_vec(&manifest)
            .map_err(|err| StorageError::Transient(err.to_string()))?;
        fs::write(&manifest_path, bytes)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: manifest_path,
            })?;
        Ok(upload_ref)
    }

    async fn put_part(
        &self,
        upload_ref: &str,
        part_number: u32,
        data: &[u8],
    ) -> StorageResult<PartReceipt> {
        if part_number == 0 {
            return Err(StorageError::InvalidPart {
                upload_ref: upload_ref.to_string(),
                part_number,
                reason: "part numbers start at 1".to_string(),
            });
        }
        let dir = self.upload_dir(upload_ref);
        if !dir.exists() {
            return Err(StorageError::UploadNotFound(upload_ref.to_string()));
        }
        let path = Self::part_file(&dir, part_number);
        fs::write(&path, data)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: path.clone(),
            })?;
        let mut hasher = Sha256::new();
        hasher.update(data);
        Ok(PartReceipt {
            part_number,
            checksum: hex_encode(hasher.finalize()),
        })
    }

    async fn complete_multipart(
        &self,
        upload_ref: &str,
        parts: &[PartReceipt],
    ) -> StorageResult<ObjectMeta> {
        let manifest = self.read_manifest(upload_ref).await?;
        let dir = self.upload_dir(upload_ref);

        let mut ordered: Vec<&PartReceipt> = parts.iter().collect();
        ordered.sort_by_key(|part| part.part_number);

        let destination = self.object_path(&manifest.key);
        Self::ensure_parent(&destination).await?;
        let mut output = fs::File::create(&destination)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: destination.clone(),
            })?;

        let mut total = 0u64;
        for part in ordered {
            let path = Self::part_file(&dir, part.part_number);
            let data = fs::read(&path).await.map_err(|_| StorageError::InvalidPart {
                upload_ref: upload_ref.to_string(),
                part_number: part.part_number,
                reason: "part data missing".to_string(),
            })?;
            let mut hasher = Sha256::new();
            hasher.update(&data);
            let checksum = hex_encode(hasher.finalize());
            if checksum != part.checksum {
                return Err(StorageError::InvalidPart {
                    upload_ref: upload_ref.to_string(),
                    part_number: part.part_number,
                    reason: "checksum mismatch".to_string(),
                });
            }
            total += data.len() as u64;
            output
                .write_all(&data)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: destination.clone(),
                })?;
        }
        output.flush().await.map_err(|source| StorageError::Io {
            source,
            path: destination.clone(),
        })?;

        self.write_meta(&manifest.key, &manifest.content_type, CachePolicy::Source, total)
            .await?;
        fs::remove_dir_all(&dir)
            .await
            .map_err(|source| StorageError::Io { source, path: dir })?;

        Ok(ObjectMeta {
            key: manifest.key,
            size: total,
            content_type: Some(manifest.content_type),
        })
    }

    async fn abort_multipart(&self, upload_ref: &str) -> StorageResult<()> {
        let dir = self.upload_dir(upload_ref);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(upload_ref, "abort of unknown multipart upload ignored");
                Ok(())
            }
            Err(source) => Err(StorageError::Io { source, path: dir }),
        }
    }

    async fn get_object(&self, key: &str, destination: &Path) -> StorageResult<u64> {
        let source = self.object_path(key);
        if !source.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Self::ensure_parent(destination).await?;
        fs::copy(&source, destination)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: destination.to_path_buf(),
            })
    }

    async fn put_object(
        &self,
        key: &str,
        source: &Path,
        content_type: &str,
        cache: CachePolicy,
    ) -> StorageResult<()> {
        let destination = self.object_path(key);
        Self::ensure_parent(&destination).await?;
        let size = fs::copy(source, &destination)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: destination.clone(),
            })?;
        self.write_meta(key, content_type, cache, size).await
    }

    async fn head_object(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(key);
        let metadata = fs::metadata(&path)
            .await
            .map_err(|_| StorageError::NotFound(key.to_string()))?;
        let content_type = self.cached_meta(key).map(|(content_type, _)| content_type);
        Ok(ObjectMeta {
            key: key.to_string(),
            size: metadata.len(),
            content_type,
        })
    }
}
