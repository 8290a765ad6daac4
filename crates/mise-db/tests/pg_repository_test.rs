//! Repository tests against a live Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p mise-db -- --ignored`.

use chrono::Utc;
use mise_core::models::{BackendId, BitrateLadder, JobState, VideoState};
use mise_db::{
    JobRepository, JobStore, StorageObjectRepository, SubmitOutcome, Submission, VideoRepository,
    VideoStore, MIGRATOR,
};
use mise_storage::{ObjectCatalog, ObjectWrite};
use sqlx::PgPool;
use uuid::Uuid;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("Failed to connect to Postgres");
    MIGRATOR.run(&pool).await.expect("Failed to run migrations");
    pool
}

fn submission(recipe_id: Uuid, master_key: &str) -> Submission {
    Submission {
        recipe_id,
        ordinal: 0,
        master_key: master_key.to_string(),
        ladder: BitrateLadder::default(),
        max_attempts: 3,
    }
}

/// Only one queued or running job may exist per video, enforced by the database.
#[tokio::test]
#[ignore] // Requires Postgres
async fn test_submit_conflicts_while_job_active() {
    let pool = pool().await;
    let videos = VideoRepository::new(pool.clone());
    let recipe = Uuid::new_v4();

    let SubmitOutcome::Accepted { video, job } =
        videos.submit(submission(recipe, "masters/one")).await.unwrap()
    else {
        panic!("first submission should be accepted");
    };
    assert_eq!(video.state, VideoState::Pending);

    match videos.submit(submission(recipe, "masters/two")).await.unwrap() {
        SubmitOutcome::Conflict { active_job_id, .. } => assert_eq!(active_job_id, job.id),
        SubmitOutcome::Accepted { .. } => panic!("second active job was created"),
    }
}

/// Claiming twice with the same version only succeeds once; completion publishes.
#[tokio::test]
#[ignore] // Requires Postgres
async fn test_claim_complete_publish() {
    let pool = pool().await;
    let videos = VideoRepository::new(pool.clone());
    let jobs = JobRepository::new(pool.clone());

    let SubmitOutcome::Accepted { video, job } =
        videos.submit(submission(Uuid::new_v4(), "masters/m")).await.unwrap()
    else {
        panic!("submission should be accepted");
    };

    let now = Utc::now();
    let claimed = jobs.try_claim(job.id, job.version, now).await.unwrap().unwrap();
    assert_eq!(claimed.attempt_count, 1);
    assert!(jobs.try_claim(job.id, job.version, now).await.unwrap().is_none());

    let done = jobs
        .complete(claimed.id, claimed.version, &[], now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.state, JobState::Succeeded);

    let ready = videos
        .publish(video.id, done.id, "renditions/master.m3u8")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ready.state, VideoState::Ready);
    assert_eq!(ready.current_rendition_set, Some(done.id));
}

/// Catalog writes are compare-and-swap on the entry version.
#[tokio::test]
#[ignore] // Requires Postgres
async fn test_catalog_compare_and_swap() {
    let pool = pool().await;
    let catalog = StorageObjectRepository::new(pool);
    let key = format!("test/{}/master.mp4", Uuid::new_v4());
    let write = ObjectWrite {
        key: key.clone(),
        backend: BackendId::new("primary").unwrap(),
        size: 4,
        checksum_sha256: "00".repeat(32),
        content_type: "video/mp4".to_string(),
    };

    let first = catalog.record(write.clone(), None).await.unwrap().unwrap();
    assert_eq!(first.version, 1);
    assert!(catalog.record(write.clone(), None).await.unwrap().is_none());

    let moved = catalog
        .commit_backend(
            &key,
            &BackendId::new("primary").unwrap(),
            &BackendId::new("archive").unwrap(),
            first.version,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.backend.as_str(), "archive");
    assert!(!catalog.remove(&key, first.version).await.unwrap());
    assert!(catalog.remove(&key, moved.version).await.unwrap());
}
