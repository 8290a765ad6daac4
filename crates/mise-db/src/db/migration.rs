use anyhow::{Context, Result};
use async_trait::async_trait;
use mise_core::models::{BackendId, MigrationRecord, MigrationState, MigrationTally};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::store_traits::MigrationStore;

const MIGRATION_COLUMNS: &str = "id, source_backend, dest_backend, prefix, state, cursor, \
    copied, skipped, failed, created_at, updated_at";

/// Repository for the storage_migrations table.
#[derive(Clone)]
pub struct MigrationRepository {
    pool: PgPool,
}

impl MigrationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationStore for MigrationRepository {
    #[tracing::instrument(skip(self), fields(db.table = "storage_migrations"))]
    async fn create_migration(
        &self,
        source: &BackendId,
        dest: &BackendId,
        prefix: &str,
    ) -> Result<MigrationRecord> {
        let record = sqlx::query_as::<Postgres, MigrationRecord>(&format!(
            r#"
            INSERT INTO storage_migrations (id, source_backend, dest_backend, prefix, state)
            VALUES ($1, $2, $3, $4, 'running')
            RETURNING {}
            "#,
            MIGRATION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(source.as_str())
        .bind(dest.as_str())
        .bind(prefix)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create migration")?;
        Ok(record)
    }

    #[tracing::instrument(skip(self), fields(db.table = "storage_migrations", db.record_id = %id))]
    async fn get_migration(&self, id: Uuid) -> Result<Option<MigrationRecord>> {
        let record = sqlx::query_as::<Postgres, MigrationRecord>(&format!(
            "SELECT {} FROM storage_migrations WHERE id = $1",
            MIGRATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch migration")?;
        Ok(record)
    }

    #[tracing::instrument(skip(self), fields(db.table = "storage_migrations", db.record_id = %id))]
    async fn advance_migration(
        &self,
        id: Uuid,
        cursor: Option<&str>,
        tally: MigrationTally,
    ) -> Result<MigrationRecord> {
        let record = sqlx::query_as::<Postgres, MigrationRecord>(&format!(
            r#"
            UPDATE storage_migrations
            SET cursor = $2,
                copied = copied + $3,
                skipped = skipped + $4,
                failed = failed + $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            MIGRATION_COLUMNS
        ))
        .bind(id)
        .bind(cursor)
        .bind(tally.copied)
        .bind(tally.skipped)
        .bind(tally.failed)
        .fetch_one(&self.pool)
        .await
        .context("Failed to advance migration")?;
        Ok(record)
    }

    #[tracing::instrument(skip(self), fields(db.table = "storage_migrations", db.record_id = %id, state = %state))]
    async fn set_migration_state(&self, id: Uuid, state: MigrationState) -> Result<MigrationRecord> {
        let record = sqlx::query_as::<Postgres, MigrationRecord>(&format!(
            r#"
            UPDATE storage_migrations
            SET state = $2,
                cursor = CASE WHEN $2 = 'running' THEN cursor ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            MIGRATION_COLUMNS
        ))
        .bind(id)
        .bind(state.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to update migration state")?;
        Ok(record)
    }

    #[tracing::instrument(skip(self), fields(db.table = "storage_migrations", db.record_id = %id))]
    async fn restart_migration(&self, id: Uuid) -> Result<MigrationRecord> {
        let record = sqlx::query_as::<Postgres, MigrationRecord>(&format!(
            r#"
            UPDATE storage_migrations
            SET state = 'running', cursor = NULL, failed = 0, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            MIGRATION_COLUMNS
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to restart migration")?;
        Ok(record)
    }
}
