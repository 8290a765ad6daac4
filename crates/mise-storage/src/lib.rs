//! Mise Storage Library
//!
//! Provider-agnostic object storage for the video pipeline. Physical backends implement the
//! [`Storage`] trait (S3-compatible, local filesystem, in-memory); the
//! [`ObjectStoreAdapter`] sits on top and resolves the backend for every key from the
//! [`ObjectCatalog`], verifies writes, and retries transient failures.
//!
//! # Storage key format
//!
//! - **Uploaded masters**: `masters/{recipe_id}/{ordinal}/{upload_id}`
//! - **Renditions**: `renditions/{video_id}/{job_id}/a{attempt}/{label}/index.m3u8` and
//!   `.../{label}/segment_00000.ts`, with the master playlist at `.../master.m3u8`
//!
//! Keys must not contain `..`, empty components, or a leading `/`. Key generation is
//! centralized in the `keys` module so all backends stay consistent.

pub mod adapter;
pub mod catalog;
pub mod checksum;
pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod memory;
pub mod retry;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use adapter::ObjectStoreAdapter;
pub use catalog::{ObjectCatalog, ObjectWrite};
pub use factory::{create_adapter, create_backend};
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use memory::{Fault, FaultOp, InMemoryCatalog, InMemoryStorage};
pub use retry::RetryPolicy;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{ByteReader, ByteStream, ObjectHeaders, Storage, StorageError, StorageResult};
