use crate::keys::validate_key;
use crate::traits::{ByteReader, ByteStream, ObjectHeaders, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mise_core::models::{BackendId, BackendKind, ObjectKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Local filesystem storage implementation
#[derive(Clone)]
pub struct LocalStorage {
    id: BackendId,
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `base_path` (created if missing).
    pub async fn new(id: BackendId, base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::Config(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage { id, base_path })
    }

    /// Convert storage key to filesystem path with security validation
    ///
    /// Keys are validated first, then the resolved path must stay inside the base directory
    /// even when intermediate directories are symlinks.
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        validate_key(storage_key)?;

        let path = self.base_path.join(storage_key);

        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::Config(format!("Failed to canonicalize base path: {}", e))
        })?;

        // Walk up to the deepest existing ancestor and make sure it resolves inside the base.
        let mut probe = path.as_path();
        loop {
            if let Ok(canonical) = probe.canonicalize() {
                if canonical.strip_prefix(&base_canonical).is_err() {
                    return Err(StorageError::InvalidKey(
                        "Storage key resolves outside storage directory".to_string(),
                    ));
                }
                break;
            }
            match probe.parent() {
                Some(parent) => probe = parent,
                None => break,
            }
        }

        Ok(path)
    }

    /// Ensure parent directory exists
    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn part_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }

    fn map_io(key: &str, e: std::io::Error) -> StorageError {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            std::io::ErrorKind::PermissionDenied => StorageError::Permanent(e.to_string()),
            std::io::ErrorKind::StorageFull => StorageError::QuotaExceeded(e.to_string()),
            _ => StorageError::Io(e),
        }
    }

    /// Move a fully written `.part` file into place so readers never see partial content.
    async fn commit_part(&self, key: &str, part: &Path, path: &Path) -> StorageResult<u64> {
        fs::rename(part, path).await.map_err(|e| Self::map_io(key, e))?;
        let metadata = fs::metadata(path).await.map_err(|e| Self::map_io(key, e))?;
        Ok(metadata.len())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders> {
        let path = self.key_to_path(key)?;
        self.ensure_parent_dir(&path).await?;
        let part = Self::part_path(&path);
        let start = std::time::Instant::now();

        let mut file = fs::File::create(&part)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        file.sync_all().await.map_err(|e| Self::map_io(key, e))?;
        drop(file);

        let size = self.commit_part(key, &part, &path).await?;

        tracing::debug!(
            backend = %self.id,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local put successful"
        );

        Ok(ObjectHeaders {
            size,
            etag: None,
            content_type: Some(content_type.to_string()),
        })
    }

    async fn put_stream(
        &self,
        key: &str,
        mut reader: ByteReader,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders> {
        let path = self.key_to_path(key)?;
        self.ensure_parent_dir(&path).await?;
        let part = Self::part_path(&path);
        let start = std::time::Instant::now();

        let mut file = fs::File::create(&part)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        let copied = tokio::io::copy(&mut reader, &mut file).await;
        if let Err(e) = copied {
            let _ = fs::remove_file(&part).await;
            return Err(Self::map_io(key, e));
        }
        file.sync_all().await.map_err(|e| Self::map_io(key, e))?;
        drop(file);

        let size = self.commit_part(key, &part, &path).await?;

        tracing::info!(
            backend = %self.id,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local stream put successful"
        );

        Ok(ObjectHeaders {
            size,
            etag: None,
            content_type: Some(content_type.to_string()),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_to_path(key)?;
        let data = fs::read(&path).await.map_err(|e| Self::map_io(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.key_to_path(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        tracing::debug!(backend = %self.id, key = %key, "Local delete successful");
        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectHeaders> {
        let path = self.key_to_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(ObjectHeaders {
            size: metadata.len(),
            etag: None,
            content_type: Some(ObjectKind::from_key(key).content_type().to_string()),
        })
    }
}
