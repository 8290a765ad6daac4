//! Authoritative-backend catalog.
//!
//! Which backend holds the canonical copy of a key is recorded here and never inferred from
//! presence. Every mutation is a compare-and-swap on the entry's version so concurrent
//! writers and migrations serialize per object without a lock.

use async_trait::async_trait;
use mise_core::models::{BackendId, StorageObject};

/// Facts about a completed, verified write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectWrite {
    pub key: String,
    pub backend: BackendId,
    pub size: i64,
    pub checksum_sha256: String,
    pub content_type: String,
}

#[async_trait]
pub trait ObjectCatalog: Send + Sync {
    async fn lookup(&self, key: &str) -> anyhow::Result<Option<StorageObject>>;

    /// Record a write. With `expected_version = None` the key must not exist yet; otherwise
    /// the entry must still be at that version. Returns `None` when the precondition fails.
    async fn record(
        &self,
        write: ObjectWrite,
        expected_version: Option<i64>,
    ) -> anyhow::Result<Option<StorageObject>>;

    /// Remove an entry if it is still at `expected_version`.
    async fn remove(&self, key: &str, expected_version: i64) -> anyhow::Result<bool>;

    /// Flip the authoritative backend from `from` to `to` if the entry is unchanged.
    async fn commit_backend(
        &self,
        key: &str,
        from: &BackendId,
        to: &BackendId,
        expected_version: i64,
    ) -> anyhow::Result<Option<StorageObject>>;

    /// Entries authoritative on `backend` under `prefix`, ordered by key, strictly after
    /// `after` when given.
    async fn list_on_backend(
        &self,
        backend: &BackendId,
        prefix: &str,
        after: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<StorageObject>>;
}
