//! Test helpers: the full application over the in-memory store, two in-memory storage
//! backends and the scripted encoder, driven through `axum_test::TestServer`.
//!
//! Run from workspace root: `cargo test -p mise-api`.
#![allow(dead_code)]

use axum_test::multipart::{MultipartForm, Part};
use axum_test::{TestResponse, TestServer};
use mise_api::setup::assemble;
use mise_api::state::AppState;
use mise_core::Config;
use mise_processing::ScriptedEngine;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const ORIGIN: &str = "http://localhost";
pub const VIEWER: &str = "user:42";
pub const SEGMENTS_PER_RUNG: usize = 3;
pub const SEGMENT_BYTES: usize = 2048;

pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub engine: Arc<ScriptedEngine>,
    pub _scratch: TempDir,
}

fn test_vars(scratch: &TempDir) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = [
        ("STORE", "memory"),
        ("STORAGE_BACKENDS", "primary,secondary"),
        ("STORAGE_PRIMARY_KIND", "memory"),
        ("STORAGE_SECONDARY_KIND", "memory"),
        ("STORAGE_PRIMARY_SIGNING_SECRET", SECRET),
        ("STORAGE_SECONDARY_SIGNING_SECRET", SECRET),
        ("STORAGE_PRIMARY_PUBLIC_URL", "http://localhost/origin"),
        ("STORAGE_SECONDARY_PUBLIC_URL", "http://localhost/origin"),
        ("STORAGE_RETRY_BASE_DELAY_MS", "1"),
        ("STORAGE_RETRY_MAX_DELAY_MS", "5"),
        ("TRANSCODE_POLL_INTERVAL_MS", "5"),
        ("TRANSCODE_STALE_REAP_INTERVAL_SECS", "0"),
        ("PLAYBACK_SEGMENT_WINDOW", "2"),
        ("MIGRATION_BATCH_SIZE", "4"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert(
        "TRANSCODE_SCRATCH_DIR".to_string(),
        scratch.path().display().to_string(),
    );
    vars
}

/// Application with default settings.
pub async fn setup_test_app(engine: ScriptedEngine) -> TestApp {
    setup_test_app_with(engine, &[]).await
}

/// Application with extra configuration variables.
pub async fn setup_test_app_with(engine: ScriptedEngine, overrides: &[(&str, &str)]) -> TestApp {
    let scratch = tempfile::tempdir().unwrap();
    let mut vars = test_vars(&scratch);
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();
    config.validate().unwrap();

    let engine = Arc::new(engine);
    let (state, router) = assemble(config, engine.clone()).await.unwrap();
    let server = TestServer::new(router).unwrap();
    TestApp {
        server,
        state,
        engine,
        _scratch: scratch,
    }
}

pub fn master_bytes() -> Vec<u8> {
    vec![0x42u8; 64 * 1024]
}

pub fn upload_form(recipe_id: Uuid, ordinal: i32, ladder: Option<&str>) -> MultipartForm {
    let mut form = MultipartForm::new()
        .add_text("recipe_id", recipe_id.to_string())
        .add_text("ordinal", ordinal.to_string());
    if let Some(ladder) = ladder {
        form = form.add_text("ladder", ladder.to_string());
    }
    form.add_part(
        "file",
        Part::bytes(master_bytes())
            .file_name("pasta.mp4")
            .mime_type("video/mp4"),
    )
}

pub const THREE_RUNGS: &str = r#"[
    {"label":"1080p","width":1920,"height":1080,"video_bitrate_kbps":5000,"audio_bitrate_kbps":128},
    {"label":"720p","width":1280,"height":720,"video_bitrate_kbps":2800,"audio_bitrate_kbps":128},
    {"label":"360p","width":640,"height":360,"video_bitrate_kbps":800,"audio_bitrate_kbps":96}
]"#;

impl TestApp {
    pub async fn upload(&self, recipe_id: Uuid, ordinal: i32) -> TestResponse {
        self.server
            .post("/api/v1/videos")
            .multipart(upload_form(recipe_id, ordinal, Some(THREE_RUNGS)))
            .await
    }

    /// Upload a master and return the new video id.
    pub async fn upload_ok(&self) -> Uuid {
        let response = self.upload(Uuid::new_v4(), 0).await;
        assert_eq!(response.status_code(), 201, "{}", response.text());
        let body: Value = response.json();
        body["id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn video(&self, id: Uuid) -> Value {
        let response = self.server.get(&format!("/api/v1/videos/{}", id)).await;
        assert_eq!(response.status_code(), 200);
        response.json()
    }

    /// Poll the status endpoint until the video reaches `state`.
    pub async fn wait_for_state(&self, id: Uuid, state: &str) -> Value {
        for _ in 0..1000 {
            let status = self.video(id).await;
            if status["video"]["state"] == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("video {} never reached {}", id, state);
    }

    pub async fn wait_for_job<F>(&self, id: &str, done: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        for _ in 0..1000 {
            let response = self.server.get(&format!("/api/v1/jobs/{}", id)).await;
            assert_eq!(response.status_code(), 200);
            let job: Value = response.json();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached the expected state", id);
    }

    pub async fn ready_video(&self) -> Uuid {
        let id = self.upload_ok().await;
        self.wait_for_state(id, "ready").await;
        id
    }

    pub async fn playback(&self, id: Uuid) -> TestResponse {
        self.server
            .post(&format!("/api/v1/videos/{}/playback", id))
            .add_header("x-principal-id", VIEWER)
            .await
    }

    /// Fetch a descriptor URL through the test server.
    pub async fn fetch(&self, url: &str) -> TestResponse {
        let path = url
            .strip_prefix(ORIGIN)
            .unwrap_or_else(|| panic!("descriptor {} not on the test origin", url));
        self.server.get(path).await
    }
}
