//! Postgres-backed authoritative-backend catalog.

use anyhow::{Context, Result};
use async_trait::async_trait;
use mise_core::models::{BackendId, StorageObject};
use mise_storage::{ObjectCatalog, ObjectWrite};
use sqlx::{PgPool, Postgres};

const OBJECT_COLUMNS: &str = "key, backend, size, checksum_sha256, content_type, version, updated_at";

/// Escape LIKE metacharacters so a key prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Repository for the storage_objects table.
#[derive(Clone)]
pub struct StorageObjectRepository {
    pool: PgPool,
}

impl StorageObjectRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObjectCatalog for StorageObjectRepository {
    #[tracing::instrument(skip(self), fields(db.table = "storage_objects"))]
    async fn lookup(&self, key: &str) -> Result<Option<StorageObject>> {
        let object = sqlx::query_as::<Postgres, StorageObject>(&format!(
            "SELECT {} FROM storage_objects WHERE key = $1",
            OBJECT_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up storage object")?;
        Ok(object)
    }

    #[tracing::instrument(skip(self, write), fields(db.table = "storage_objects", key = %write.key, backend = %write.backend))]
    async fn record(
        &self,
        write: ObjectWrite,
        expected_version: Option<i64>,
    ) -> Result<Option<StorageObject>> {
        let object = match expected_version {
            None => sqlx::query_as::<Postgres, StorageObject>(&format!(
                r#"
                INSERT INTO storage_objects (key, backend, size, checksum_sha256, content_type, version, updated_at)
                VALUES ($1, $2, $3, $4, $5, 1, NOW())
                ON CONFLICT (key) DO NOTHING
                RETURNING {}
                "#,
                OBJECT_COLUMNS
            ))
            .bind(&write.key)
            .bind(write.backend.as_str())
            .bind(write.size)
            .bind(&write.checksum_sha256)
            .bind(&write.content_type)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to insert storage object")?,
            Some(version) => sqlx::query_as::<Postgres, StorageObject>(&format!(
                r#"
                UPDATE storage_objects
                SET backend = $2,
                    size = $3,
                    checksum_sha256 = $4,
                    content_type = $5,
                    version = version + 1,
                    updated_at = NOW()
                WHERE key = $1 AND version = $6
                RETURNING {}
                "#,
                OBJECT_COLUMNS
            ))
            .bind(&write.key)
            .bind(write.backend.as_str())
            .bind(write.size)
            .bind(&write.checksum_sha256)
            .bind(&write.content_type)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to update storage object")?,
        };
        Ok(object)
    }

    #[tracing::instrument(skip(self), fields(db.table = "storage_objects"))]
    async fn remove(&self, key: &str, expected_version: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM storage_objects WHERE key = $1 AND version = $2")
            .bind(key)
            .bind(expected_version)
            .execute(&self.pool)
            .await
            .context("Failed to delete storage object")?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "storage_objects"))]
    async fn commit_backend(
        &self,
        key: &str,
        from: &BackendId,
        to: &BackendId,
        expected_version: i64,
    ) -> Result<Option<StorageObject>> {
        let object = sqlx::query_as::<Postgres, StorageObject>(&format!(
            r#"
            UPDATE storage_objects
            SET backend = $3, version = version + 1, updated_at = NOW()
            WHERE key = $1 AND backend = $2 AND version = $4
            RETURNING {}
            "#,
            OBJECT_COLUMNS
        ))
        .bind(key)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to commit authoritative backend")?;
        Ok(object)
    }

    #[tracing::instrument(skip(self), fields(db.table = "storage_objects"))]
    async fn list_on_backend(
        &self,
        backend: &BackendId,
        prefix: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<StorageObject>> {
        let objects = sqlx::query_as::<Postgres, StorageObject>(&format!(
            r#"
            SELECT {}
            FROM storage_objects
            WHERE backend = $1
              AND key LIKE $2 ESCAPE '\'
              AND ($3::TEXT IS NULL OR key > $3)
            ORDER BY key ASC
            LIMIT $4
            "#,
            OBJECT_COLUMNS
        ))
        .bind(backend.as_str())
        .bind(like_prefix(prefix))
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list storage objects")?;
        Ok(objects)
    }
}
