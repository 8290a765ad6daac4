//! Test helpers: an in-process pipeline over the in-memory store, in-memory storage backends
//! and the scripted encoder.
//!
//! Run from workspace root: `cargo test -p mise-services`.
#![allow(dead_code)]

use chrono::Utc;
use mise_core::models::{
    BackendId, BitrateLadder, BitrateRung, RecipeVideo, TranscodeJob, VideoState,
};
use mise_core::{AccessSettings, AppError, CachePolicyEngine};
use mise_db::{JobStore, MemoryStore, VideoStore};
use mise_processing::{RunnerConfig, ScriptedEngine, TranscodeRunner};
use mise_services::{
    IngestCoordinator, MasterUpload, MigrationOrchestrator, PlaybackService, SignedParams,
    SignedUrlIssuer, TranscodePipeline,
};
use mise_storage::{InMemoryCatalog, InMemoryStorage, ObjectStoreAdapter, RetryPolicy, Storage};
use mise_worker::{JobExecutor, TranscodeWorkerPool, WorkerPoolConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const PUBLIC_URL: &str = "https://media.example.com/origin";
pub const SEGMENTS_PER_RUNG: usize = 3;

pub fn backend(id: &str) -> BackendId {
    BackendId::new(id).unwrap()
}

pub fn three_rung_ladder() -> BitrateLadder {
    BitrateLadder::new(vec![
        BitrateRung::new("1080p", 1920, 1080, 5000),
        BitrateRung::new("720p", 1280, 720, 2800),
        BitrateRung::new("360p", 640, 360, 800),
    ])
    .unwrap()
}

pub fn access_settings() -> AccessSettings {
    AccessSettings {
        manifest_ttl: Duration::from_secs(600),
        segment_ttl: Duration::from_secs(900),
        max_ttl: Duration::from_secs(900),
        bind_ip: false,
        playback_segment_window: 2,
        authorizer_url: None,
    }
}

pub fn fast_pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        max_workers: 2,
        poll_interval: Duration::from_millis(5),
        job_timeout: Duration::from_secs(30),
        stale_reap_interval: Duration::ZERO,
        stale_grace: Duration::ZERO,
        cancel_poll_interval: Duration::from_millis(5),
        retry_backoff_unit: Duration::from_millis(1),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub primary: Arc<InMemoryStorage>,
    pub secondary: Arc<InMemoryStorage>,
    pub storage: Arc<ObjectStoreAdapter>,
    pub engine: Arc<ScriptedEngine>,
    pub ingest: Arc<IngestCoordinator>,
    pub issuer: Arc<SignedUrlIssuer>,
    pub playback: PlaybackService,
    pub migrations: MigrationOrchestrator,
    pub pipeline: Arc<TranscodePipeline>,
    pub pool: Option<TranscodeWorkerPool>,
    pub scratch: TempDir,
}

impl Harness {
    /// Pipeline with a running worker pool.
    pub fn new(engine: ScriptedEngine) -> Self {
        let mut harness = Self::without_workers(engine);
        harness.start_pool();
        harness
    }

    /// Pipeline whose jobs stay queued until a pool is started.
    pub fn without_workers(engine: ScriptedEngine) -> Self {
        let store = Arc::new(MemoryStore::new());
        let primary = Arc::new(InMemoryStorage::new(backend("primary")));
        let secondary = Arc::new(InMemoryStorage::new(backend("secondary")));
        let backends: Vec<Arc<dyn Storage>> = vec![primary.clone(), secondary.clone()];
        let storage = Arc::new(
            ObjectStoreAdapter::new(backends, backend("primary"), Arc::new(InMemoryCatalog::new()))
                .unwrap()
                .with_retry(RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                }),
        );

        let ingest = Arc::new(IngestCoordinator::new(
            store.clone(),
            store.clone(),
            storage.clone(),
            BitrateLadder::default(),
            3,
        ));
        let issuer = Arc::new(
            SignedUrlIssuer::new(&access_settings(), CachePolicyEngine::default())
                .with_backend(backend("primary"), PUBLIC_URL, SECRET)
                .with_backend(backend("secondary"), PUBLIC_URL, SECRET),
        );
        let playback = PlaybackService::new(store.clone(), storage.clone(), issuer.clone(), 2);
        let migrations = MigrationOrchestrator::new(storage.clone(), store.clone(), 2);

        let engine = Arc::new(engine);
        let scratch = tempfile::tempdir().unwrap();
        let runner = TranscodeRunner::new(
            engine.clone(),
            storage.clone(),
            RunnerConfig {
                scratch_dir: scratch.path().to_path_buf(),
                segment_duration: 4,
                poll_interval: Duration::from_millis(2),
            },
        );
        let pipeline = Arc::new(TranscodePipeline::new(runner, ingest.clone()));

        Self {
            store,
            primary,
            secondary,
            storage,
            engine,
            ingest,
            issuer,
            playback,
            migrations,
            pipeline,
            pool: None,
            scratch,
        }
    }

    pub fn start_pool(&mut self) {
        let executor: Arc<dyn JobExecutor> = self.pipeline.clone();
        self.pool = Some(TranscodeWorkerPool::start(
            self.store.clone(),
            fast_pool_config(),
            Arc::downgrade(&executor),
            None,
        ));
    }

    pub fn pool(&self) -> &TranscodeWorkerPool {
        self.pool.as_ref().expect("pool not started")
    }

    pub async fn upload(
        &self,
        recipe_id: Uuid,
        ordinal: i32,
        ladder: Option<BitrateLadder>,
    ) -> Result<RecipeVideo, AppError> {
        self.ingest
            .submit(MasterUpload {
                recipe_id,
                ordinal,
                ladder,
                content_type: "video/mp4".to_string(),
                body: Box::pin(std::io::Cursor::new(vec![0x42u8; 64 * 1024])),
            })
            .await
    }

    pub async fn wait_for_video(&self, id: Uuid, state: VideoState) -> RecipeVideo {
        for _ in 0..1000 {
            let video = self.store.get_video(id).await.unwrap().unwrap();
            if video.state == state {
                return video;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("video {} never reached {}", id, state);
    }

    pub async fn wait_for_job<F>(&self, id: Uuid, done: F) -> TranscodeJob
    where
        F: Fn(&TranscodeJob) -> bool,
    {
        for _ in 0..1000 {
            let job = self.store.get_job(id).await.unwrap().unwrap();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached the expected state", id);
    }

    pub async fn latest_job(&self, video_id: Uuid) -> TranscodeJob {
        self.store.latest_job(video_id).await.unwrap().unwrap()
    }

    pub fn master_keys(&self) -> Vec<String> {
        self.primary
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("masters/"))
            .collect()
    }
}

/// Split a descriptor URL into its storage key and signed query parameters, the way the
/// origin route receives them.
pub fn parse_descriptor_url(url: &str) -> (String, SignedParams) {
    let rest = url
        .strip_prefix(PUBLIC_URL)
        .and_then(|r| r.strip_prefix('/'))
        .expect("descriptor on the test origin");
    let (path, query) = rest.split_once('?').unwrap();
    let key = percent_encoding::percent_decode_str(path)
        .decode_utf8()
        .unwrap()
        .to_string();

    let mut map = HashMap::new();
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap();
        map.insert(
            k.to_string(),
            percent_encoding::percent_decode_str(v)
                .decode_utf8()
                .unwrap()
                .to_string(),
        );
    }
    let params = SignedParams {
        b: map["b"].clone(),
        exp: map["exp"].parse().unwrap(),
        iat: map["iat"].parse().unwrap(),
        p: map["p"].clone(),
        ip: map.get("ip").cloned(),
        sig: map["sig"].clone(),
    };
    (key, params)
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
