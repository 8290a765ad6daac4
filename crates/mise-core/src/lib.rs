//! Mise Core Library
//!
//! Domain models, the error taxonomy, configuration and the cache policy shared by every
//! crate of the recipe video pipeline.

pub mod cache_policy;
pub mod config;
pub mod error;
pub mod job_error;
pub mod models;

// Re-export commonly used types
pub use cache_policy::{CachePolicy, CachePolicyEngine, Cacheability};
pub use config::{AccessSettings, BackendConfig, Config, StorageSettings, StoreKind, TranscodeSettings};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use job_error::{JobError, JobErrorKind, JobResultExt};
