//! Migration orchestrator: moves objects under a prefix from one backend to another.
//!
//! Every object goes through copy, verify, then a compare-and-swap of its authoritative
//! backend in the catalog. A crash at any point leaves each object servable from exactly one
//! backend. Objects the destination already holds byte-identical are committed without a
//! second copy, which makes re-runs cheap and idempotent. Source objects are never deleted.

use mise_core::models::{BackendId, MigrationRecord, MigrationState, MigrationTally, StorageObject};
use mise_core::AppError;
use mise_db::MigrationStore;
use mise_storage::{ObjectStoreAdapter, StorageResult};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::storage_app_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectOutcome {
    Copied,
    /// Destination already held the bytes; only the commit ran.
    Skipped,
    /// A concurrent write changed the entry; the next scan picks it up again.
    Raced,
}

#[derive(Clone)]
pub struct MigrationOrchestrator {
    storage: Arc<ObjectStoreAdapter>,
    store: Arc<dyn MigrationStore>,
    batch_size: i64,
}

impl MigrationOrchestrator {
    pub fn new(storage: Arc<ObjectStoreAdapter>, store: Arc<dyn MigrationStore>, batch_size: i64) -> Self {
        Self {
            storage,
            store,
            batch_size: batch_size.max(1),
        }
    }

    fn check_backends(&self, source: &BackendId, dest: &BackendId) -> Result<(), AppError> {
        if source == dest {
            return Err(AppError::InvalidInput(
                "Source and destination backends must differ".to_string(),
            ));
        }
        for id in [source, dest] {
            self.storage
                .backend(id)
                .map_err(|_| AppError::InvalidInput(format!("Unknown storage backend {}", id)))?;
        }
        Ok(())
    }

    /// Create a migration and run it in the background. The returned id is the handle for
    /// [`get`](Self::get) and [`resume`](Self::resume).
    pub async fn start(
        &self,
        source: &BackendId,
        dest: &BackendId,
        prefix: &str,
    ) -> Result<MigrationRecord, AppError> {
        self.check_backends(source, dest)?;
        let record = self.store.create_migration(source, dest, prefix).await?;
        self.spawn(record.clone());
        Ok(record)
    }

    /// Create a migration and run it to the end.
    pub async fn migrate(
        &self,
        source: &BackendId,
        dest: &BackendId,
        prefix: &str,
    ) -> Result<MigrationRecord, AppError> {
        self.check_backends(source, dest)?;
        let record = self.store.create_migration(source, dest, prefix).await?;
        Ok(self.run(record).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<MigrationRecord, AppError> {
        self.store
            .get_migration(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Migration {} not found", id)))
    }

    /// Continue an interrupted migration from its cursor, or start a new pass over a
    /// finished one to retry the objects that failed. Runs to the end.
    pub async fn resume(&self, id: Uuid) -> Result<MigrationRecord, AppError> {
        let record = self.prepare_resume(id).await?;
        Ok(self.run(record).await?)
    }

    /// [`resume`](Self::resume) in the background.
    pub async fn resume_in_background(&self, id: Uuid) -> Result<MigrationRecord, AppError> {
        let record = self.prepare_resume(id).await?;
        self.spawn(record.clone());
        Ok(record)
    }

    async fn prepare_resume(&self, id: Uuid) -> Result<MigrationRecord, AppError> {
        let record = self.get(id).await?;
        self.check_backends(&record.source, &record.dest)?;
        Ok(match record.state {
            MigrationState::Running => record,
            MigrationState::Completed | MigrationState::CompletedWithFailures => {
                self.store.restart_migration(id).await?
            }
        })
    }

    fn spawn(&self, record: MigrationRecord) {
        let this = self.clone();
        tokio::spawn(async move {
            let id = record.id;
            if let Err(e) = this.run(record).await {
                tracing::error!(error = %e, migration.id = %id, "Migration stopped, resume to continue");
            }
        });
    }

    #[tracing::instrument(skip(self, record), fields(
        migration.id = %record.id,
        source = %record.source,
        dest = %record.dest,
        prefix = %record.prefix
    ))]
    async fn run(&self, mut record: MigrationRecord) -> anyhow::Result<MigrationRecord> {
        let start = std::time::Instant::now();
        tracing::info!(cursor = ?record.cursor, "Migration pass started");

        loop {
            let page = self
                .storage
                .list_authoritative(
                    &record.source,
                    &record.prefix,
                    record.cursor.as_deref(),
                    self.batch_size,
                )
                .await
                .map_err(storage_app_error)?;
            let Some(last) = page.last().map(|o| o.key.clone()) else {
                break;
            };

            let mut tally = MigrationTally::default();
            for entry in &page {
                match self.migrate_object(entry, &record.source, &record.dest).await {
                    Ok(ObjectOutcome::Copied) => tally.copied += 1,
                    Ok(ObjectOutcome::Skipped) => tally.skipped += 1,
                    Ok(ObjectOutcome::Raced) => {
                        tracing::info!(key = %entry.key, "Object changed during migration, will retry on next pass");
                        tally.failed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, key = %entry.key, "Failed to migrate object");
                        tally.failed += 1;
                    }
                }
            }
            record = self
                .store
                .advance_migration(record.id, Some(&last), tally)
                .await?;
        }

        let state = if record.failed > 0 {
            MigrationState::CompletedWithFailures
        } else {
            MigrationState::Completed
        };
        let record = self.store.set_migration_state(record.id, state).await?;
        tracing::info!(
            state = %record.state,
            copied = record.copied,
            skipped = record.skipped,
            failed = record.failed,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Migration pass finished"
        );
        Ok(record)
    }

    async fn migrate_object(
        &self,
        entry: &StorageObject,
        source: &BackendId,
        dest: &BackendId,
    ) -> StorageResult<ObjectOutcome> {
        let outcome = if self.storage.holds_copy(entry, dest).await? {
            ObjectOutcome::Skipped
        } else {
            self.storage.copy(&entry.key, source, dest).await?;
            ObjectOutcome::Copied
        };

        match self
            .storage
            .commit_backend(&entry.key, source, dest, entry.version)
            .await?
        {
            Some(_) => {
                tracing::debug!(key = %entry.key, outcome = ?outcome, "Object now authoritative on destination");
                Ok(outcome)
            }
            None => Ok(ObjectOutcome::Raced),
        }
    }
}
