//! Application state shared by every handler.

use crate::auth::Authorizer;
use mise_core::Config;
use mise_services::{IngestCoordinator, MigrationOrchestrator, PlaybackService, SignedUrlIssuer};
use mise_storage::ObjectStoreAdapter;
use mise_worker::{JobExecutor, TranscodeWorkerPool};
use sqlx::PgPool;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    /// Present only when `STORE=postgres`.
    pub db: Option<PgPool>,
    pub storage: Arc<ObjectStoreAdapter>,
    pub ingest: Arc<IngestCoordinator>,
    pub playback: Arc<PlaybackService>,
    pub issuer: Arc<SignedUrlIssuer>,
    pub migrations: MigrationOrchestrator,
    pub authorizer: Arc<dyn Authorizer>,
    pub workers: TranscodeWorkerPool,
    /// The pool holds the executor weakly; this keeps it alive for the life of the app.
    pub executor: Arc<dyn JobExecutor>,
}
