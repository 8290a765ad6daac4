//! Storage abstraction trait
//!
//! This module defines the [`Storage`] trait that every physical backend implements, and
//! the error taxonomy backends report. Callers normally go through
//! [`ObjectStoreAdapter`](crate::ObjectStoreAdapter), which picks the backend per key.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use mise_core::models::{BackendId, BackendKind};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Network failure or 5xx: safe to retry with backoff.
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// Authentication, authorization or malformed request: never retried.
    #[error("Permanent storage error: {0}")]
    Permanent(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// The stored object does not match what was written.
    #[error("Integrity check failed for {key}: expected {expected}, found {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("Object catalog error: {0}")]
    Catalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Only transient and IO failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Io(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Chunked object body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Reader consumed by streaming uploads.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// What a backend reports about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

/// One physical storage backend.
///
/// Backends know nothing about which keys they are authoritative for; that lives in the
/// [`ObjectCatalog`](crate::ObjectCatalog).
#[async_trait]
pub trait Storage: Send + Sync {
    fn backend_id(&self) -> &BackendId;

    fn kind(&self) -> BackendKind;

    /// Write an object in one request.
    async fn put(&self, key: &str, data: Bytes, content_type: &str)
        -> StorageResult<ObjectHeaders>;

    /// Write an object from a reader without buffering it whole. The reader is consumed
    /// until EOF; a failed call cannot be retried with the same reader.
    async fn put_stream(
        &self,
        key: &str,
        reader: ByteReader,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Read an object as a stream of chunks.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Delete an object. Missing objects yield `NotFound`.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn head(&self, key: &str) -> StorageResult<ObjectHeaders>;
}
