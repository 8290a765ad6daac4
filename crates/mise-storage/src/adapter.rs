//! Backend-agnostic object operations.
//!
//! [`ObjectStoreAdapter`] resolves the backend for every call from the catalog's authoritative
//! entry (new keys go to the primary), retries transient failures, verifies writes before
//! reporting success, and records them through a version compare-and-swap so that a write
//! racing a migration commit re-resolves instead of landing on a stale backend.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use mise_core::models::{BackendId, StorageObject};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::StreamReader;

use crate::catalog::{ObjectCatalog, ObjectWrite};
use crate::checksum::{sha256_hex, HashingReader};
use crate::keys::validate_key;
use crate::retry::{retry_transient, RetryPolicy};
use crate::traits::{ByteReader, ByteStream, ObjectHeaders, Storage, StorageError, StorageResult};

/// Rounds of re-resolution before a contended write gives up.
const MAX_CAS_ROUNDS: usize = 5;

pub const DEFAULT_VERIFY_CHECKSUM_MAX_BYTES: u64 = 64 * 1024 * 1024;

fn catalog_err(e: anyhow::Error) -> StorageError {
    StorageError::Catalog(format!("{:#}", e))
}

pub struct ObjectStoreAdapter {
    backends: HashMap<BackendId, Arc<dyn Storage>>,
    primary: BackendId,
    catalog: Arc<dyn ObjectCatalog>,
    retry: RetryPolicy,
    verify_checksum_max_bytes: u64,
}

impl ObjectStoreAdapter {
    pub fn new(
        backends: Vec<Arc<dyn Storage>>,
        primary: BackendId,
        catalog: Arc<dyn ObjectCatalog>,
    ) -> StorageResult<Self> {
        let mut by_id = HashMap::with_capacity(backends.len());
        for backend in backends {
            let id = backend.backend_id().clone();
            if by_id.insert(id.clone(), backend).is_some() {
                return Err(StorageError::Config(format!(
                    "Storage backend {} configured twice",
                    id
                )));
            }
        }
        if !by_id.contains_key(&primary) {
            return Err(StorageError::UnknownBackend(primary.to_string()));
        }

        Ok(Self {
            backends: by_id,
            primary,
            catalog,
            retry: RetryPolicy::default(),
            verify_checksum_max_bytes: DEFAULT_VERIFY_CHECKSUM_MAX_BYTES,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verify_checksum_max_bytes(mut self, limit: u64) -> Self {
        self.verify_checksum_max_bytes = limit;
        self
    }

    pub fn primary(&self) -> &BackendId {
        &self.primary
    }

    pub fn backend(&self, id: &BackendId) -> StorageResult<Arc<dyn Storage>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownBackend(id.to_string()))
    }

    pub fn backend_ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn catalog(&self) -> &Arc<dyn ObjectCatalog> {
        &self.catalog
    }

    pub async fn lookup(&self, key: &str) -> StorageResult<Option<StorageObject>> {
        self.catalog.lookup(key).await.map_err(catalog_err)
    }

    /// Catalog entry for `key`, or `NotFound`.
    pub async fn resolve(&self, key: &str) -> StorageResult<StorageObject> {
        self.lookup(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    /// Write `data` to the key's authoritative backend (primary for new keys), verify it and
    /// record it in the catalog.
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<StorageObject> {
        validate_key(key)?;
        let size = data.len() as u64;
        let checksum = sha256_hex(&data);

        for round in 0..MAX_CAS_ROUNDS {
            let current = self.lookup(key).await?;
            let target = current
                .as_ref()
                .map(|o| o.backend.clone())
                .unwrap_or_else(|| self.primary.clone());
            let backend = self.backend(&target)?;

            retry_transient(&self.retry, "put", key, || {
                backend.put(key, data.clone(), content_type)
            })
            .await?;
            self.verify_write(backend.as_ref(), key, size, &checksum)
                .await?;

            let write = ObjectWrite {
                key: key.to_string(),
                backend: target.clone(),
                size: size as i64,
                checksum_sha256: checksum.clone(),
                content_type: content_type.to_string(),
            };
            match self
                .catalog
                .record(write, current.as_ref().map(|o| o.version))
                .await
                .map_err(catalog_err)?
            {
                Some(recorded) => {
                    tracing::debug!(
                        key = %key,
                        backend = %target,
                        size_bytes = size,
                        version = recorded.version,
                        "Object stored"
                    );
                    return Ok(recorded);
                }
                None => {
                    tracing::warn!(
                        key = %key,
                        backend = %target,
                        round,
                        "Catalog entry changed during write, re-resolving backend"
                    );
                }
            }
        }

        Err(StorageError::Transient(format!(
            "Catalog contention while writing {}",
            key
        )))
    }

    /// Stream a large object to the primary (or authoritative) backend.
    ///
    /// The reader cannot be replayed, so the upload itself is a single attempt. If the
    /// authoritative backend moves while the upload runs, the finished object is copied to
    /// the new backend before it is recorded.
    pub async fn put_stream(
        &self,
        key: &str,
        reader: ByteReader,
        content_type: &str,
    ) -> StorageResult<StorageObject> {
        validate_key(key)?;
        let start = std::time::Instant::now();

        let current = self.lookup(key).await?;
        let mut written_on = current
            .as_ref()
            .map(|o| o.backend.clone())
            .unwrap_or_else(|| self.primary.clone());
        let backend = self.backend(&written_on)?;

        let (hashing, digest) = HashingReader::new(reader);
        backend
            .put_stream(key, Box::pin(hashing), content_type)
            .await?;
        let (checksum, size) = digest.finish();
        self.verify_write(backend.as_ref(), key, size, &checksum)
            .await?;

        let mut expected_version = current.map(|o| o.version);
        for round in 0..MAX_CAS_ROUNDS {
            let write = ObjectWrite {
                key: key.to_string(),
                backend: written_on.clone(),
                size: size as i64,
                checksum_sha256: checksum.clone(),
                content_type: content_type.to_string(),
            };
            if let Some(recorded) = self
                .catalog
                .record(write, expected_version)
                .await
                .map_err(catalog_err)?
            {
                tracing::info!(
                    key = %key,
                    backend = %written_on,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Streamed object stored"
                );
                return Ok(recorded);
            }

            let latest = self.lookup(key).await?;
            let target = latest
                .as_ref()
                .map(|o| o.backend.clone())
                .unwrap_or_else(|| self.primary.clone());
            if target != written_on {
                tracing::warn!(
                    key = %key,
                    from = %written_on,
                    to = %target,
                    round,
                    "Authoritative backend moved during upload, relocating object"
                );
                let from = self.backend(&written_on)?;
                let to = self.backend(&target)?;
                self.copy_verified(from.as_ref(), to.as_ref(), key, size, &checksum, content_type)
                    .await?;
                written_on = target;
            }
            expected_version = latest.map(|o| o.version);
        }

        Err(StorageError::Transient(format!(
            "Catalog contention while writing {}",
            key
        )))
    }

    pub async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let entry = self.resolve(key).await?;
        let backend = self.backend(&entry.backend)?;
        retry_transient(&self.retry, "get", key, || backend.get(key)).await
    }

    pub async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let entry = self.resolve(key).await?;
        let backend = self.backend(&entry.backend)?;
        retry_transient(&self.retry, "get_stream", key, || backend.get_stream(key)).await
    }

    /// Size and etag as reported by the authoritative backend; the content type is the one
    /// the object was written with.
    pub async fn headers(&self, key: &str) -> StorageResult<ObjectHeaders> {
        let entry = self.resolve(key).await?;
        let backend = self.backend(&entry.backend)?;
        let mut headers = retry_transient(&self.retry, "head", key, || backend.head(key)).await?;
        if !entry.content_type.is_empty() {
            headers.content_type = Some(entry.content_type);
        }
        Ok(headers)
    }

    /// Remove the catalog entry, then the physical object on its authoritative backend.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        for _ in 0..MAX_CAS_ROUNDS {
            let entry = self.resolve(key).await?;
            if !self
                .catalog
                .remove(key, entry.version)
                .await
                .map_err(catalog_err)?
            {
                continue;
            }

            let backend = self.backend(&entry.backend)?;
            match retry_transient(&self.retry, "delete", key, || backend.delete(key)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::warn!(key = %key, backend = %entry.backend, "Catalogued object was already gone");
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        }
        Err(StorageError::Transient(format!(
            "Catalog contention while deleting {}",
            key
        )))
    }

    /// Delete every catalogued key under `prefix`; returns the number of removed objects.
    pub async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for backend in self.backend_ids() {
            loop {
                let page = self
                    .catalog
                    .list_on_backend(&backend, prefix, None, 500)
                    .await
                    .map_err(catalog_err)?;
                if page.is_empty() {
                    break;
                }
                for entry in page {
                    match self.delete(&entry.key).await {
                        Ok(()) => removed += 1,
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Copy the catalogued object from `from` to `to`, verifying size and checksum against the
    /// catalog entry. The authoritative backend is left unchanged.
    pub async fn copy(
        &self,
        key: &str,
        from: &BackendId,
        to: &BackendId,
    ) -> StorageResult<ObjectHeaders> {
        if from == to {
            return Err(StorageError::Permanent(format!(
                "Cannot copy {} onto its own backend {}",
                key, from
            )));
        }
        let entry = self.resolve(key).await?;
        let source = self.backend(from)?;
        let dest = self.backend(to)?;

        let expected_size = entry.size as u64;
        retry_transient(&self.retry, "copy", key, || {
            self.copy_verified(
                source.as_ref(),
                dest.as_ref(),
                key,
                expected_size,
                &entry.checksum_sha256,
                &entry.content_type,
            )
        })
        .await
    }

    /// Whether `backend` already holds a byte-identical copy of the catalogued object.
    pub async fn holds_copy(&self, entry: &StorageObject, backend: &BackendId) -> StorageResult<bool> {
        let storage = self.backend(backend)?;
        let key = entry.key.as_str();
        let headers = match retry_transient(&self.retry, "head", key, || storage.head(key)).await {
            Ok(headers) => headers,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if headers.size != entry.size as u64 {
            return Ok(false);
        }
        let (checksum, _) = self.checksum_on(storage.as_ref(), key).await?;
        Ok(checksum == entry.checksum_sha256)
    }

    /// Flip the authoritative backend of `key` if the entry is still at `expected_version`.
    pub async fn commit_backend(
        &self,
        key: &str,
        from: &BackendId,
        to: &BackendId,
        expected_version: i64,
    ) -> StorageResult<Option<StorageObject>> {
        self.catalog
            .commit_backend(key, from, to, expected_version)
            .await
            .map_err(catalog_err)
    }

    pub async fn list_authoritative(
        &self,
        backend: &BackendId,
        prefix: &str,
        after: Option<&str>,
        limit: i64,
    ) -> StorageResult<Vec<StorageObject>> {
        self.catalog
            .list_on_backend(backend, prefix, after, limit)
            .await
            .map_err(catalog_err)
    }

    async fn verify_write(
        &self,
        backend: &dyn Storage,
        key: &str,
        size: u64,
        checksum: &str,
    ) -> StorageResult<()> {
        let headers = retry_transient(&self.retry, "head", key, || backend.head(key)).await?;
        if headers.size != size {
            self.discard(backend, key).await;
            tracing::error!(
                key = %key,
                backend = %backend.backend_id(),
                expected_bytes = size,
                stored_bytes = headers.size,
                "Stored object size does not match write"
            );
            return Err(StorageError::IntegrityMismatch {
                key: key.to_string(),
                expected: format!("{} bytes", size),
                actual: format!("{} bytes", headers.size),
            });
        }

        if size <= self.verify_checksum_max_bytes {
            let (actual, _) = self.checksum_on(backend, key).await?;
            if actual != checksum {
                self.discard(backend, key).await;
                tracing::error!(
                    key = %key,
                    backend = %backend.backend_id(),
                    "Stored object checksum does not match write"
                );
                return Err(StorageError::IntegrityMismatch {
                    key: key.to_string(),
                    expected: checksum.to_string(),
                    actual,
                });
            }
        }
        Ok(())
    }

    async fn copy_verified(
        &self,
        source: &dyn Storage,
        dest: &dyn Storage,
        key: &str,
        expected_size: u64,
        expected_checksum: &str,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders> {
        let start = std::time::Instant::now();
        let stream = source.get_stream(key).await?;
        let reader = StreamReader::new(stream.map_err(std::io::Error::other));
        let (hashing, digest) = HashingReader::new(reader);

        dest.put_stream(key, Box::pin(hashing), content_type).await?;
        let (checksum, copied) = digest.finish();
        let headers = dest.head(key).await?;

        if copied != expected_size || headers.size != expected_size {
            self.discard(dest, key).await;
            return Err(StorageError::IntegrityMismatch {
                key: key.to_string(),
                expected: format!("{} bytes", expected_size),
                actual: format!("{} bytes", headers.size.min(copied)),
            });
        }
        if checksum != expected_checksum {
            self.discard(dest, key).await;
            return Err(StorageError::IntegrityMismatch {
                key: key.to_string(),
                expected: expected_checksum.to_string(),
                actual: checksum,
            });
        }

        // The stream hash covers what was read; the destination must also hold it intact.
        let (stored, _) = self.checksum_on(dest, key).await?;
        if stored != expected_checksum {
            self.discard(dest, key).await;
            return Err(StorageError::IntegrityMismatch {
                key: key.to_string(),
                expected: expected_checksum.to_string(),
                actual: stored,
            });
        }

        tracing::debug!(
            key = %key,
            from = %source.backend_id(),
            to = %dest.backend_id(),
            size_bytes = copied,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Object copied"
        );
        Ok(headers)
    }

    async fn checksum_on(&self, backend: &dyn Storage, key: &str) -> StorageResult<(String, u64)> {
        let mut stream = retry_transient(&self.retry, "get_stream", key, || backend.get_stream(key)).await?;
        let mut hasher = Sha256::new();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            hasher.update(&chunk);
        }
        Ok((hex::encode(hasher.finalize()), total))
    }

    async fn discard(&self, backend: &dyn Storage, key: &str) {
        if let Err(e) = backend.delete(key).await {
            if !e.is_not_found() {
                tracing::warn!(
                    error = %e,
                    key = %key,
                    backend = %backend.backend_id(),
                    "Failed to remove unverified object"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCatalog, InMemoryStorage};

    fn id(s: &str) -> BackendId {
        BackendId::new(s).unwrap()
    }

    #[test]
    fn primary_must_be_configured() {
        let backends: Vec<Arc<dyn Storage>> = vec![Arc::new(InMemoryStorage::new(id("a")))];
        let result = ObjectStoreAdapter::new(backends, id("b"), Arc::new(InMemoryCatalog::new()));
        assert!(matches!(result, Err(StorageError::UnknownBackend(_))));
    }

    #[test]
    fn duplicate_backends_rejected() {
        let backends: Vec<Arc<dyn Storage>> = vec![
            Arc::new(InMemoryStorage::new(id("a"))),
            Arc::new(InMemoryStorage::new(id("a"))),
        ];
        let result = ObjectStoreAdapter::new(backends, id("a"), Arc::new(InMemoryCatalog::new()));
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[tokio::test]
    async fn copy_onto_same_backend_is_permanent_error() {
        let backends: Vec<Arc<dyn Storage>> = vec![Arc::new(InMemoryStorage::new(id("a")))];
        let adapter =
            ObjectStoreAdapter::new(backends, id("a"), Arc::new(InMemoryCatalog::new())).unwrap();
        adapter
            .put("x/seg.ts", Bytes::from_static(b"abc"), "video/mp2t")
            .await
            .unwrap();
        let err = adapter.copy("x/seg.ts", &id("a"), &id("a")).await.unwrap_err();
        assert!(matches!(err, StorageError::Permanent(_)));
    }
}
