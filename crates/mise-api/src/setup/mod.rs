//! Application setup and initialization
//!
//! [`initialize_app`] is what the binary runs. [`assemble`] wires the same application
//! around any encoding engine, which is how the HTTP tests run it without ffmpeg.

pub mod database;
pub mod routes;
pub mod server;

use crate::auth::{AllowAll, Authorizer, HttpAuthorizer};
use crate::state::AppState;
use anyhow::{Context, Result};
use mise_core::models::BitrateLadder;
use mise_core::{Config, StoreKind};
use mise_db::{
    JobRepository, JobStore, MemoryStore, MigrationRepository, MigrationStore,
    StorageObjectRepository, VideoRepository, VideoStore,
};
use mise_processing::{EncodingEngine, FfmpegEngine, RunnerConfig, TranscodeRunner};
use mise_services::{
    IngestCoordinator, MigrationOrchestrator, PlaybackService, SignedUrlIssuer, TranscodePipeline,
};
use mise_storage::{create_adapter, InMemoryCatalog, ObjectCatalog};
use mise_worker::{JobExecutor, TranscodeWorkerPool, WorkerPoolConfig};
use sqlx::PgPool;
use std::sync::Arc;

struct Stores {
    db: Option<PgPool>,
    videos: Arc<dyn VideoStore>,
    jobs: Arc<dyn JobStore>,
    migrations: Arc<dyn MigrationStore>,
    catalog: Arc<dyn ObjectCatalog>,
}

async fn setup_stores(config: &Config) -> Result<Stores> {
    match config.store {
        StoreKind::Postgres => {
            let pool = database::setup_database(config).await?;
            Ok(Stores {
                videos: Arc::new(VideoRepository::new(pool.clone())),
                jobs: Arc::new(JobRepository::new(pool.clone())),
                migrations: Arc::new(MigrationRepository::new(pool.clone())),
                catalog: Arc::new(StorageObjectRepository::new(pool.clone())),
                db: Some(pool),
            })
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                db: None,
                videos: store.clone(),
                jobs: store.clone(),
                migrations: store,
                catalog: Arc::new(InMemoryCatalog::new()),
            })
        }
    }
}

/// Initialize the entire application
pub async fn initialize_app(config: Config) -> Result<(Arc<AppState>, axum::Router)> {
    crate::telemetry::init_telemetry(config.log_json)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    tracing::info!(environment = %config.environment, "Configuration loaded and validated successfully");

    let engine = FfmpegEngine::new(
        config.transcode.ffmpeg_path.clone(),
        config.transcode.ffprobe_path.clone(),
    )
    .context("Failed to initialize ffmpeg")?;

    assemble(config, Arc::new(engine)).await
}

/// Build stores, storage, services and the worker pool around `engine`, then the router.
pub async fn assemble(
    config: Config,
    engine: Arc<dyn EncodingEngine>,
) -> Result<(Arc<AppState>, axum::Router)> {
    let stores = setup_stores(&config).await?;

    let storage = Arc::new(
        create_adapter(&config.storage, stores.catalog.clone())
            .await
            .context("Failed to initialize storage backends")?,
    );
    tracing::info!(
        primary = %storage.primary(),
        backends = storage.backend_ids().len(),
        "Storage initialized"
    );

    let ingest = Arc::new(IngestCoordinator::new(
        stores.videos.clone(),
        stores.jobs.clone(),
        storage.clone(),
        BitrateLadder::default(),
        config.transcode.max_attempts,
    ));
    let issuer = Arc::new(SignedUrlIssuer::from_config(
        &config.storage,
        &config.access,
        config.cache.engine(),
    ));
    let playback = Arc::new(PlaybackService::new(
        stores.videos.clone(),
        storage.clone(),
        issuer.clone(),
        config.access.playback_segment_window,
    ));
    let migrations = MigrationOrchestrator::new(
        storage.clone(),
        stores.migrations.clone(),
        config.migration_batch_size,
    );

    // Publish any completion that was recorded but not applied before the last shutdown.
    match ingest.reconcile().await {
        Ok(0) => {}
        Ok(published) => tracing::info!(published, "Reconciled completed transcodes"),
        Err(e) => tracing::warn!(error = %e, "Startup reconciliation failed"),
    }

    let runner = TranscodeRunner::new(
        engine,
        storage.clone(),
        RunnerConfig {
            scratch_dir: config.transcode.scratch_dir.clone(),
            segment_duration: config.transcode.hls_segment_duration,
            ..RunnerConfig::default()
        },
    );
    let executor: Arc<dyn JobExecutor> =
        Arc::new(TranscodePipeline::new(runner, ingest.clone()));
    let workers = TranscodeWorkerPool::start(
        stores.jobs.clone(),
        WorkerPoolConfig::from(&config.transcode),
        Arc::downgrade(&executor),
        stores.db.clone(),
    );

    let authorizer: Arc<dyn Authorizer> = match &config.access.authorizer_url {
        Some(url) => {
            tracing::info!(url = %url, "Using HTTP authorizer");
            Arc::new(HttpAuthorizer::new(url.clone())?)
        }
        None => {
            if config.is_production() {
                tracing::warn!("AUTHORIZER_URL not set; every principal may watch every video");
            }
            Arc::new(AllowAll)
        }
    };

    let state = Arc::new(AppState {
        config,
        db: stores.db,
        storage,
        ingest,
        playback,
        issuer,
        migrations,
        authorizer,
        workers,
        executor,
    });
    let router = routes::setup_routes(state.clone());
    Ok((state, router))
}
