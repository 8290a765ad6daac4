//! Backend-to-backend migration over in-memory storage.

mod helpers;

use bytes::Bytes;
use helpers::{backend, Harness};
use mise_core::models::{MigrationState, MigrationTally};
use mise_core::AppError;
use mise_db::MigrationStore;
use mise_processing::ScriptedEngine;
use mise_storage::{Fault, FaultOp};
use std::time::Duration;

const PREFIX: &str = "renditions/";

/// Five catalogued segments on the primary backend.
async fn seed(harness: &Harness) -> Vec<String> {
    let mut keys = Vec::new();
    for i in 0..5 {
        let key = format!("renditions/v/j/a1/720p/segment_{:05}.ts", i);
        harness
            .storage
            .put(&key, Bytes::from(vec![i as u8; 1024]), "video/mp2t")
            .await
            .unwrap();
        keys.push(key);
    }
    keys
}

fn harness() -> Harness {
    Harness::without_workers(ScriptedEngine::new(1))
}

/// Every object under the prefix ends up authoritative on the destination, byte-identical,
/// and the source copies are left in place.
#[tokio::test]
async fn test_migration_moves_all_objects() {
    let harness = harness();
    let keys = seed(&harness).await;

    let record = harness
        .migrations
        .migrate(&backend("primary"), &backend("secondary"), PREFIX)
        .await
        .unwrap();
    assert_eq!(record.state, MigrationState::Completed);
    assert_eq!((record.copied, record.skipped, record.failed), (5, 0, 0));
    assert!(record.cursor.is_none());

    for key in &keys {
        let entry = harness.storage.resolve(key).await.unwrap();
        assert_eq!(entry.backend, backend("secondary"));
        assert!(harness.secondary.contains(key));
        assert!(harness.primary.contains(key));
        assert!(harness.storage.holds_copy(&entry, &backend("secondary")).await.unwrap());
    }
}

/// Running the same migration again finds nothing left on the source.
#[tokio::test]
async fn test_migration_rerun_is_noop() {
    let harness = harness();
    seed(&harness).await;
    let source = backend("primary");
    let dest = backend("secondary");

    harness.migrations.migrate(&source, &dest, PREFIX).await.unwrap();
    let writes = harness.secondary.put_count();

    let again = harness.migrations.migrate(&source, &dest, PREFIX).await.unwrap();
    assert_eq!(again.state, MigrationState::Completed);
    assert_eq!((again.copied, again.skipped, again.failed), (0, 0, 0));
    assert_eq!(harness.secondary.put_count(), writes);
}

/// An object copied before a crash, but never committed, is committed without a second copy.
#[tokio::test]
async fn test_copy_without_commit_is_skipped() {
    let harness = harness();
    let keys = seed(&harness).await;
    let source = backend("primary");
    let dest = backend("secondary");

    harness.storage.copy(&keys[0], &source, &dest).await.unwrap();
    assert_eq!(harness.storage.resolve(&keys[0]).await.unwrap().backend, source);
    let writes = harness.secondary.put_count();

    let record = harness.migrations.migrate(&source, &dest, PREFIX).await.unwrap();
    assert_eq!((record.copied, record.skipped, record.failed), (4, 1, 0));
    assert_eq!(harness.secondary.put_count(), writes + 4);

    for key in &keys {
        assert_eq!(harness.storage.resolve(key).await.unwrap().backend, dest);
    }
    assert!(harness
        .storage
        .list_authoritative(&source, PREFIX, None, 100)
        .await
        .unwrap()
        .is_empty());
}

/// A destination that refuses a write leaves that object on the source; resuming the
/// migration finishes the job.
#[tokio::test]
async fn test_failed_object_retried_on_resume() {
    let harness = harness();
    let keys = seed(&harness).await;
    harness.secondary.inject(FaultOp::Put, Fault::Permanent, 1);

    let record = harness
        .migrations
        .migrate(&backend("primary"), &backend("secondary"), PREFIX)
        .await
        .unwrap();
    assert_eq!(record.state, MigrationState::CompletedWithFailures);
    assert_eq!((record.copied, record.failed), (4, 1));
    assert_eq!(harness.storage.resolve(&keys[0]).await.unwrap().backend, backend("primary"));

    let resumed = harness.migrations.resume(record.id).await.unwrap();
    assert_eq!(resumed.id, record.id);
    assert_eq!(resumed.state, MigrationState::Completed);
    assert_eq!((resumed.copied, resumed.failed), (5, 0));
    for key in &keys {
        assert_eq!(harness.storage.resolve(key).await.unwrap().backend, backend("secondary"));
    }
}

/// An interrupted pass continues strictly after its cursor.
#[tokio::test]
async fn test_resume_continues_from_cursor() {
    let harness = harness();
    let keys = seed(&harness).await;
    let source = backend("primary");
    let dest = backend("secondary");

    // A pass that committed the first two objects before its process died.
    let record = harness.store.create_migration(&source, &dest, PREFIX).await.unwrap();
    for key in &keys[..2] {
        let entry = harness.storage.resolve(key).await.unwrap();
        harness.storage.copy(key, &source, &dest).await.unwrap();
        harness
            .storage
            .commit_backend(key, &source, &dest, entry.version)
            .await
            .unwrap()
            .unwrap();
    }
    harness
        .store
        .advance_migration(
            record.id,
            Some(&keys[1]),
            MigrationTally {
                copied: 2,
                ..MigrationTally::default()
            },
        )
        .await
        .unwrap();

    let resumed = harness.migrations.resume(record.id).await.unwrap();
    assert_eq!(resumed.state, MigrationState::Completed);
    assert_eq!((resumed.copied, resumed.skipped, resumed.failed), (5, 0, 0));
    for key in &keys {
        assert_eq!(harness.storage.resolve(key).await.unwrap().backend, dest);
    }
}

/// Background migrations report through their record.
#[tokio::test]
async fn test_background_migration_completes() {
    let harness = harness();
    seed(&harness).await;

    let started = harness
        .migrations
        .start(&backend("primary"), &backend("secondary"), PREFIX)
        .await
        .unwrap();
    assert_eq!(started.state, MigrationState::Running);

    let mut record = started;
    for _ in 0..200 {
        record = harness.migrations.get(record.id).await.unwrap();
        if record.state != MigrationState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(record.state, MigrationState::Completed);
    assert_eq!(record.copied, 5);
}

/// Same-backend and unknown-backend migrations are rejected before anything is recorded.
#[tokio::test]
async fn test_invalid_backends_rejected() {
    let harness = harness();
    let same = harness
        .migrations
        .migrate(&backend("primary"), &backend("primary"), PREFIX)
        .await
        .unwrap_err();
    assert!(matches!(same, AppError::InvalidInput(_)));

    let unknown = harness
        .migrations
        .start(&backend("primary"), &backend("glacier"), PREFIX)
        .await
        .unwrap_err();
    assert!(matches!(unknown, AppError::InvalidInput(_)));

    assert!(matches!(
        harness.migrations.get(uuid::Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));
}

/// Overwrites after a migration land on the object's new backend.
#[tokio::test]
async fn test_writes_follow_authoritative_backend() {
    let harness = harness();
    let keys = seed(&harness).await;
    harness
        .migrations
        .migrate(&backend("primary"), &backend("secondary"), PREFIX)
        .await
        .unwrap();

    let updated = harness
        .storage
        .put(&keys[0], Bytes::from_static(b"replacement"), "video/mp2t")
        .await
        .unwrap();
    assert_eq!(updated.backend, backend("secondary"));
    assert_eq!(
        harness.storage.get(&keys[0]).await.unwrap(),
        Bytes::from_static(b"replacement")
    );
}
