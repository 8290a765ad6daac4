//! Process-local backend and catalog.
//!
//! Used for development (`STORAGE_<ID>_KIND=memory`, `STORE=memory`) and throughout the test
//! suites. The backend supports fault injection so retry, verification and migration
//! recovery paths can be exercised deterministically.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream;
use mise_core::models::{BackendId, BackendKind, StorageObject};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;

use crate::catalog::{ObjectCatalog, ObjectWrite};
use crate::keys::validate_key;
use crate::traits::{ByteReader, ByteStream, ObjectHeaders, Storage, StorageError, StorageResult};

const STREAM_CHUNK: usize = 64 * 1024;

/// Failure to inject into the next matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent,
    Quota,
    /// Store one byte less than written and report success.
    Truncate,
    /// Flip the first stored byte and report success.
    Corrupt,
}

impl Fault {
    fn into_error(self, key: &str) -> StorageError {
        match self {
            Fault::Transient => StorageError::Transient(format!("injected 503 for {}", key)),
            Fault::Permanent => StorageError::Permanent(format!("injected 403 for {}", key)),
            Fault::Quota => StorageError::QuotaExceeded(format!("injected quota for {}", key)),
            Fault::Truncate | Fault::Corrupt => {
                StorageError::Transient(format!("injected damage for {}", key))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Put,
    Get,
    Delete,
    Head,
}

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

pub struct InMemoryStorage {
    id: BackendId,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    faults: Mutex<HashMap<FaultOp, Vec<Fault>>>,
    puts: AtomicU64,
}

impl InMemoryStorage {
    pub fn new(id: BackendId) -> Self {
        Self {
            id,
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            puts: AtomicU64::new(0),
        }
    }

    /// Make the next `times` calls of `op` fail with `fault`.
    pub fn inject(&self, op: FaultOp, fault: Fault, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.entry(op).or_default().extend(std::iter::repeat_n(fault, times));
    }

    fn take_fault(&self, op: FaultOp) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let queue = faults.get_mut(&op)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    /// Number of successful physical writes, including streamed ones.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self, key: &str, mut data: Bytes, content_type: &str) -> StorageResult<ObjectHeaders> {
        validate_key(key)?;
        match self.take_fault(FaultOp::Put) {
            Some(Fault::Truncate) => {
                let len = data.len().saturating_sub(1);
                data.truncate(len);
            }
            Some(Fault::Corrupt) => {
                let mut damaged = data.to_vec();
                if let Some(first) = damaged.first_mut() {
                    *first ^= 0xff;
                }
                data = Bytes::from(damaged);
            }
            Some(fault) => return Err(fault.into_error(key)),
            None => {}
        }
        let size = data.len() as u64;
        self.lock().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(ObjectHeaders {
            size,
            etag: None,
            content_type: Some(content_type.to_string()),
        })
    }

    fn fetch(&self, op: FaultOp, key: &str) -> StorageResult<StoredObject> {
        validate_key(key)?;
        if let Some(fault) = self.take_fault(op) {
            return Err(fault.into_error(key));
        }
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders> {
        self.store(key, data, content_type)
    }

    async fn put_stream(
        &self,
        key: &str,
        mut reader: ByteReader,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders> {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        self.store(key, Bytes::from(buffer), content_type)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Ok(self.fetch(FaultOp::Get, key)?.data)
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.fetch(FaultOp::Get, key)?.data;
        let chunks: Vec<Result<Bytes, StorageError>> = (0..data.len())
            .step_by(STREAM_CHUNK)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK).min(data.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        if let Some(fault) = self.take_fault(FaultOp::Delete) {
            return Err(fault.into_error(key));
        }
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectHeaders> {
        let object = self.fetch(FaultOp::Head, key)?;
        Ok(ObjectHeaders {
            size: object.data.len() as u64,
            etag: None,
            content_type: Some(object.content_type),
        })
    }
}

/// Catalog kept in a single map; every method is atomic under one lock.
#[derive(Default)]
pub struct InMemoryCatalog {
    entries: Mutex<BTreeMap<String, StorageObject>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StorageObject>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ObjectCatalog for InMemoryCatalog {
    async fn lookup(&self, key: &str) -> anyhow::Result<Option<StorageObject>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn record(
        &self,
        write: ObjectWrite,
        expected_version: Option<i64>,
    ) -> anyhow::Result<Option<StorageObject>> {
        let mut entries = self.lock();
        let current = entries.get(&write.key).map(|o| o.version);
        if current != expected_version {
            return Ok(None);
        }
        let object = StorageObject {
            version: current.map(|v| v + 1).unwrap_or(1),
            key: write.key.clone(),
            backend: write.backend,
            size: write.size,
            checksum_sha256: write.checksum_sha256,
            content_type: write.content_type,
            updated_at: Utc::now(),
        };
        entries.insert(write.key, object.clone());
        Ok(Some(object))
    }

    async fn remove(&self, key: &str, expected_version: i64) -> anyhow::Result<bool> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(o) if o.version == expected_version => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_backend(
        &self,
        key: &str,
        from: &BackendId,
        to: &BackendId,
        expected_version: i64,
    ) -> anyhow::Result<Option<StorageObject>> {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(o) if &o.backend == from && o.version == expected_version => {
                o.backend = to.clone();
                o.version += 1;
                o.updated_at = Utc::now();
                Ok(Some(o.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_on_backend(
        &self,
        backend: &BackendId,
        prefix: &str,
        after: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<StorageObject>> {
        let entries = self.lock();
        Ok(entries
            .values()
            .filter(|o| &o.backend == backend && o.key.starts_with(prefix))
            .filter(|o| after.is_none_or(|a| o.key.as_str() > a))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
