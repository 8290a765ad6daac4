//! Mise DB Library
//!
//! Persistence for videos, transcode jobs, renditions, the object catalog and migration
//! records. Postgres repositories live under [`db`]; [`memory::MemoryStore`] implements the
//! same store traits in process.

pub mod db;
pub mod memory;
pub mod store_traits;

pub use db::{JobRepository, MigrationRepository, StorageObjectRepository, VideoRepository};
pub use memory::MemoryStore;
pub use store_traits::{JobFailure, JobStore, MigrationStore, SubmitOutcome, Submission, VideoStore};

/// Schema migrations shipped with the workspace.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
