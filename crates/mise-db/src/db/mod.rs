//! Postgres repositories
//!
//! Each repository owns one table and implements the matching trait from
//! [`crate::store_traits`] (or [`mise_storage::ObjectCatalog`] for the object catalog).
//! Queries are built at runtime with `sqlx::query_as` and explicit column lists.

pub mod job;
pub mod migration;
pub mod storage_object;
pub mod video;

pub use job::JobRepository;
pub use migration::MigrationRepository;
pub use storage_object::StorageObjectRepository;
pub use video::VideoRepository;
