//! HTTP API integration tests.
//!
//! Run with: `cargo test -p mise-api --test api_test`

mod helpers;

use helpers::{setup_test_app, setup_test_app_with, upload_form, SEGMENT_BYTES, SEGMENTS_PER_RUNG};
use mise_processing::{playlist, EncodeOutcome, ScriptedEngine};
use serde_json::{json, Value};
use uuid::Uuid;

/// Uploading a master returns 201 and the video becomes ready with published renditions.
#[tokio::test]
async fn test_upload_video_becomes_ready() {
    let app = setup_test_app(ScriptedEngine::new(SEGMENTS_PER_RUNG)).await;

    let recipe_id = Uuid::new_v4();
    let response = app.upload(recipe_id, 2).await;
    assert_eq!(response.status_code(), 201);
    let video: Value = response.json();
    assert_eq!(video["recipe_id"], recipe_id.to_string());
    assert_eq!(video["ordinal"], 2);

    let id: Uuid = video["id"].as_str().unwrap().parse().unwrap();
    let status = app.wait_for_state(id, "ready").await;
    let manifest = status["manifest_key"].as_str().unwrap();
    assert!(manifest.starts_with(&format!("renditions/{}/", id)));
    assert!(manifest.ends_with("master.m3u8"));
    assert_eq!(status["latest_job"]["state"], "succeeded");
    assert_eq!(status["latest_job"]["ladder"].as_array().unwrap().len(), 3);
}

/// Playback descriptors lead to the origin, which serves rewritten playlists and segments
/// with their cache headers.
#[tokio::test]
async fn test_playback_through_origin() {
    let app = setup_test_app(ScriptedEngine::new(SEGMENTS_PER_RUNG)).await;
    let id = app.ready_video().await;

    let response = app.playback(id).await;
    assert_eq!(response.status_code(), 200);
    let access: Value = response.json();
    assert_eq!(access["video_id"], id.to_string());
    assert_eq!(access["renditions"].as_array().unwrap().len(), 3);

    let master = app.fetch(access["manifest"]["url"].as_str().unwrap()).await;
    assert_eq!(master.status_code(), 200);
    assert_eq!(master.header("content-type"), "application/vnd.apple.mpegurl");
    assert_eq!(master.header("cache-control"), "private, max-age=300");
    let variants = playlist::uris(&master.text());
    assert_eq!(variants.len(), 3);

    let media = app.fetch(&variants[0]).await;
    assert_eq!(media.status_code(), 200);
    let segments = playlist::uris(&media.text());
    assert_eq!(segments.len(), SEGMENTS_PER_RUNG);

    let segment = app.fetch(&segments[0]).await;
    assert_eq!(segment.status_code(), 200);
    assert_eq!(segment.header("content-type"), "video/mp2t");
    assert_eq!(
        segment.header("cache-control"),
        "public, max-age=86400, immutable"
    );
    assert_eq!(segment.as_bytes().len(), SEGMENT_BYTES);
}

/// A tampered signature, a missing signature and an unknown key all look the same.
#[tokio::test]
async fn test_origin_rejections_are_uniform() {
    let app = setup_test_app(ScriptedEngine::new(1)).await;
    let id = app.ready_video().await;
    let access: Value = app.playback(id).await.json();
    let url = access["renditions"][0]["segments"][0]["url"]
        .as_str()
        .unwrap()
        .to_string();

    let (base, _) = url.split_once("&sig=").unwrap();
    let tampered = app.fetch(&format!("{}&sig={}", base, "0".repeat(64))).await;
    let unsigned = app.fetch(url.split_once('?').unwrap().0).await;
    let unknown = app
        .server
        .get("/origin/renditions/nope/segment_00000.ts?b=primary&exp=1&iat=0&p=x&sig=00")
        .await;

    for response in [&tampered, &unsigned, &unknown] {
        assert_eq!(response.status_code(), 404);
    }
    assert_eq!(tampered.text(), unsigned.text());
    assert_eq!(tampered.text(), unknown.text());
    let body: Value = tampered.json();
    assert_eq!(body["code"], "NOT_FOUND");
}

/// Playback needs a principal and an existing, published video.
#[tokio::test]
async fn test_playback_errors() {
    let app = setup_test_app(ScriptedEngine::new(1)).await;

    let missing_principal = app
        .server
        .post(&format!("/api/v1/videos/{}/playback", Uuid::new_v4()))
        .await;
    assert_eq!(missing_principal.status_code(), 400);

    let unknown = app.playback(Uuid::new_v4()).await;
    assert_eq!(unknown.status_code(), 404);
}

/// A second upload into a slot that is still transcoding is a conflict.
#[tokio::test]
async fn test_upload_conflict_while_transcoding() {
    let engine = ScriptedEngine::new(SEGMENTS_PER_RUNG);
    engine.push_outcome(EncodeOutcome::Hang { after_segments: 1 });
    let app = setup_test_app(engine).await;

    let recipe_id = Uuid::new_v4();
    assert_eq!(app.upload(recipe_id, 0).await.status_code(), 201);
    let conflict = app.upload(recipe_id, 0).await;
    assert_eq!(conflict.status_code(), 409);
    let body: Value = conflict.json();
    assert_eq!(body["code"], "CONFLICT");

    // Another slot of the same recipe is independent.
    assert_eq!(app.upload(recipe_id, 1).await.status_code(), 201);
}

/// Cancelling a running job fails it as cancelled; unknown jobs are 404.
#[tokio::test]
async fn test_cancel_job() {
    let engine = ScriptedEngine::new(SEGMENTS_PER_RUNG);
    engine.push_outcome(EncodeOutcome::Hang { after_segments: 1 });
    let app = setup_test_app(engine).await;

    let id = app.upload_ok().await;
    let status = app.video(id).await;
    let job_id = status["latest_job"]["id"].as_str().unwrap().to_string();
    app.wait_for_job(&job_id, |job| job["state"] == "running").await;

    let response = app
        .server
        .post(&format!("/api/v1/jobs/{}/cancel", job_id))
        .await;
    assert_eq!(response.status_code(), 200);

    let job = app
        .wait_for_job(&job_id, |job| job["state"] == "failed")
        .await;
    assert_eq!(job["last_error_kind"], "cancelled");

    let unknown = app
        .server
        .post(&format!("/api/v1/jobs/{}/cancel", Uuid::new_v4()))
        .await;
    assert_eq!(unknown.status_code(), 404);
}

/// Malformed upload forms are rejected before anything is stored.
#[tokio::test]
async fn test_upload_validation() {
    let app = setup_test_app(ScriptedEngine::new(1)).await;

    let bad_ladder = app
        .server
        .post("/api/v1/videos")
        .multipart(upload_form(Uuid::new_v4(), 0, Some("[]")))
        .await;
    assert_eq!(bad_ladder.status_code(), 400);

    let no_file = app
        .server
        .post("/api/v1/videos")
        .multipart(
            axum_test::multipart::MultipartForm::new()
                .add_text("recipe_id", Uuid::new_v4().to_string())
                .add_text("ordinal", "0"),
        )
        .await;
    assert_eq!(no_file.status_code(), 400);

    let bad_recipe = app
        .server
        .post("/api/v1/videos")
        .multipart(
            axum_test::multipart::MultipartForm::new()
                .add_text("recipe_id", "lasagna")
                .add_text("ordinal", "0"),
        )
        .await;
    assert_eq!(bad_recipe.status_code(), 400);

    assert_eq!(app.engine.probe_calls(), 0);
}

/// Masters larger than the configured limit are refused.
#[tokio::test]
async fn test_upload_too_large() {
    let app = setup_test_app_with(ScriptedEngine::new(1), &[("MAX_UPLOAD_BYTES", "4096")]).await;
    let response = app.upload(Uuid::new_v4(), 0).await;
    assert_eq!(response.status_code(), 413);
}

/// Re-transcoding queues a new job with the requested ladder; the old renditions keep
/// serving meanwhile.
#[tokio::test]
async fn test_retranscode() {
    let app = setup_test_app(ScriptedEngine::new(1)).await;
    let id = app.ready_video().await;
    let before = app.video(id).await["manifest_key"].clone();

    let response = app
        .server
        .post(&format!("/api/v1/videos/{}/retranscode", id))
        .json(&json!({
            "ladder": [{"label":"480p","width":854,"height":480,"video_bitrate_kbps":1400,"audio_bitrate_kbps":128}]
        }))
        .await;
    assert_eq!(response.status_code(), 202);
    let job: Value = response.json();
    assert_eq!(job["ladder"].as_array().unwrap().len(), 1);
    assert_eq!(app.video(id).await["video"]["state"], "ready");

    let job_id = job["id"].as_str().unwrap();
    app.wait_for_job(job_id, |j| j["state"] == "succeeded").await;
    let after = app.video(id).await["manifest_key"].clone();
    assert_ne!(before, after);

    let default_ladder = app
        .server
        .post(&format!("/api/v1/videos/{}/retranscode", id))
        .await;
    assert_eq!(default_ladder.status_code(), 202);

    let unknown = app
        .server
        .post(&format!("/api/v1/videos/{}/retranscode", Uuid::new_v4()))
        .await;
    assert_eq!(unknown.status_code(), 404);
}

/// Migrations start in the background, report progress and can be resumed.
#[tokio::test]
async fn test_migration_lifecycle() {
    let app = setup_test_app(ScriptedEngine::new(SEGMENTS_PER_RUNG)).await;
    let id = app.ready_video().await;
    let access: Value = app.playback(id).await.json();

    let response = app
        .server
        .post("/api/v1/migrations")
        .json(&json!({"source": "primary", "dest": "secondary", "prefix": "renditions/"}))
        .await;
    assert_eq!(response.status_code(), 202);
    let record: Value = response.json();
    let migration_id = record["id"].as_str().unwrap().to_string();

    let mut record = record;
    for _ in 0..1000 {
        record = app
            .server
            .get(&format!("/api/v1/migrations/{}", migration_id))
            .await
            .json();
        if record["state"] != "running" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(record["state"], "completed");
    assert_eq!(record["failed"], 0);
    assert!(record["copied"].as_i64().unwrap() > 0);

    // Descriptors issued before the migration still resolve.
    let segment = app
        .fetch(access["renditions"][0]["segments"][0]["url"].as_str().unwrap())
        .await;
    assert_eq!(segment.status_code(), 200);

    let resumed = app
        .server
        .post(&format!("/api/v1/migrations/{}/resume", migration_id))
        .await;
    assert_eq!(resumed.status_code(), 202);

    let same_backend = app
        .server
        .post("/api/v1/migrations")
        .json(&json!({"source": "primary", "dest": "primary"}))
        .await;
    assert_eq!(same_backend.status_code(), 400);

    let empty_source = app
        .server
        .post("/api/v1/migrations")
        .json(&json!({"source": "", "dest": "secondary"}))
        .await;
    assert_eq!(empty_source.status_code(), 400);

    let unknown = app
        .server
        .get(&format!("/api/v1/migrations/{}", Uuid::new_v4()))
        .await;
    assert_eq!(unknown.status_code(), 404);
}

/// Health reports the in-memory store and every storage backend.
#[tokio::test]
async fn test_health() {
    let app = setup_test_app(ScriptedEngine::new(1)).await;
    let response = app.server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "memory");
    assert_eq!(body["storage"]["primary"], "healthy");
    assert_eq!(body["storage"]["secondary"], "healthy");
}

/// The OpenAPI document is served.
#[tokio::test]
async fn test_openapi_document() {
    let app = setup_test_app(ScriptedEngine::new(1)).await;
    let response = app.server.get("/api-docs/openapi.json").await;
    assert_eq!(response.status_code(), 200);
    let spec: Value = response.json();
    assert!(spec["paths"]["/api/v1/videos/{id}/playback"].is_object());
}
