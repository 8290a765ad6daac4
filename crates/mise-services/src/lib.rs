//! Mise Services Layer
//!
//! Business services of the video pipeline: the ingest coordinator, the signed URL issuer,
//! playback and origin serving, storage migration, and the executor the worker pool runs
//! jobs through. HTTP handling stays in `mise-api`.

pub mod access;
pub mod error;
pub mod ingest;
pub mod migration;
pub mod pipeline;
pub mod playback;

pub use access::{AccessDescriptor, AccessGrant, AuthorizationDecision, SignedParams, SignedUrlIssuer};
pub use error::storage_app_error;
pub use ingest::{IngestCoordinator, MasterUpload, VideoStatus};
pub use migration::MigrationOrchestrator;
pub use pipeline::TranscodePipeline;
pub use playback::{OriginBody, OriginObject, PlaybackAccess, PlaybackService, RenditionAccess};
