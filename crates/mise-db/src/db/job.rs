use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mise_core::models::{JobProgress, JobState, Rendition, TranscodeJob};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::store_traits::{JobFailure, JobStore};

pub(crate) const JOB_COLUMNS: &str = "id, video_id, source_key, ladder, state, version, \
    attempt_count, max_attempts, last_error_kind, last_error_message, renditions_total, \
    renditions_done, segments_uploaded, bytes_uploaded, cancel_requested, not_before, \
    started_at, heartbeat_at, finished_at, created_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a queued job inside `tx`. Returns `None` when the video already has an active
    /// job (partial unique index violation).
    pub async fn insert_tx(
        tx: &mut Transaction<'_, Postgres>,
        job: &TranscodeJob,
    ) -> Result<Option<TranscodeJob>> {
        let result = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            INSERT INTO transcode_jobs (
                id, video_id, source_key, ladder, state, version, attempt_count,
                max_attempts, renditions_total, not_before, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'queued', 0, 0, $5, $6, $7, $8, $8)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(job.video_id)
        .bind(&job.source_key)
        .bind(Json(&job.ladder))
        .bind(job.max_attempts)
        .bind(job.progress.renditions_total)
        .bind(job.not_before)
        .bind(job.created_at)
        .fetch_one(&mut **tx)
        .await;

        match result {
            Ok(job) => Ok(Some(job)),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                tracing::debug!(video.id = %job.video_id, "Active job already exists for video");
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to insert transcode job"),
        }
    }

    async fn insert_rendition(
        tx: &mut Transaction<'_, Postgres>,
        rendition: &Rendition,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO renditions (
                id, video_id, rendition_set_id, label, width, height, bitrate_kbps,
                manifest_key, segment_keys, duration_ms, byte_size, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(rendition.id)
        .bind(rendition.video_id)
        .bind(rendition.rendition_set_id)
        .bind(&rendition.label)
        .bind(rendition.width)
        .bind(rendition.height)
        .bind(rendition.bitrate_kbps)
        .bind(&rendition.manifest_key)
        .bind(&rendition.segment_keys)
        .bind(rendition.duration_ms)
        .bind(rendition.byte_size)
        .bind(rendition.created_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert rendition")?;
        Ok(())
    }

    async fn fetch_one_where(&self, clause: &str, id: Uuid) -> Result<Option<TranscodeJob>> {
        let job = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            "SELECT {} FROM transcode_jobs WHERE {}",
            JOB_COLUMNS, clause
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch transcode job")?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for JobRepository {
    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs", db.record_id = %id))]
    async fn get_job(&self, id: Uuid) -> Result<Option<TranscodeJob>> {
        self.fetch_one_where("id = $1", id).await
    }

    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs"))]
    async fn active_job(&self, video_id: Uuid) -> Result<Option<TranscodeJob>> {
        self.fetch_one_where("video_id = $1 AND state IN ('queued', 'running')", video_id)
            .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs"))]
    async fn latest_job(&self, video_id: Uuid) -> Result<Option<TranscodeJob>> {
        self.fetch_one_where("video_id = $1 ORDER BY created_at DESC LIMIT 1", video_id)
            .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs"))]
    async fn claim_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TranscodeJob>> {
        let jobs = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            SELECT {}
            FROM transcode_jobs
            WHERE state = 'queued' AND not_before <= $1
            ORDER BY not_before ASC, created_at ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch claimable jobs")?;
        Ok(jobs)
    }

    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs", db.record_id = %id))]
    async fn try_claim(
        &self,
        id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        let job = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            UPDATE transcode_jobs
            SET state = 'running',
                version = version + 1,
                attempt_count = attempt_count + 1,
                renditions_done = 0,
                segments_uploaded = 0,
                bytes_uploaded = 0,
                started_at = $3,
                heartbeat_at = $3,
                updated_at = $3
            WHERE id = $1 AND version = $2 AND state = 'queued'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(expected_version)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim transcode job")?;

        if let Some(ref job) = job {
            tracing::debug!(job.id = %job.id, attempt = job.attempt_count, "Job claimed");
        }
        Ok(job)
    }

    async fn heartbeat(&self, id: Uuid, progress: JobProgress, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET renditions_done = $2,
                segments_uploaded = $3,
                bytes_uploaded = $4,
                heartbeat_at = $5,
                updated_at = $5
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(progress.renditions_done)
        .bind(progress.segments_uploaded)
        .bind(progress.bytes_uploaded)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to record job heartbeat")?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self, renditions), fields(db.table = "transcode_jobs", db.record_id = %id, renditions = renditions.len()))]
    async fn complete(
        &self,
        id: Uuid,
        expected_version: i64,
        renditions: &[Rendition],
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for job completion")?;

        let job = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            UPDATE transcode_jobs
            SET state = 'succeeded',
                version = version + 1,
                renditions_done = renditions_total,
                cancel_requested = FALSE,
                heartbeat_at = $3,
                finished_at = $3,
                updated_at = $3
            WHERE id = $1 AND version = $2 AND state = 'running'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(expected_version)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to mark job succeeded")?;

        let Some(job) = job else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        for rendition in renditions {
            Self::insert_rendition(&mut tx, rendition).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit job completion")?;
        Ok(Some(job))
    }

    #[tracing::instrument(skip(self, failure), fields(db.table = "transcode_jobs", db.record_id = %id, error.kind = %failure.kind))]
    async fn requeue(
        &self,
        id: Uuid,
        expected_version: i64,
        failure: JobFailure,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        let job = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            UPDATE transcode_jobs
            SET state = 'queued',
                version = version + 1,
                last_error_kind = $3,
                last_error_message = $4,
                not_before = $5,
                heartbeat_at = NULL,
                updated_at = $6
            WHERE id = $1 AND version = $2 AND state = 'running'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(expected_version)
        .bind(failure.kind.to_string())
        .bind(&failure.message)
        .bind(not_before)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to requeue transcode job")?;
        Ok(job)
    }

    #[tracing::instrument(skip(self, failure), fields(db.table = "transcode_jobs", db.record_id = %id, state = %state))]
    async fn finish(
        &self,
        id: Uuid,
        expected_version: i64,
        state: JobState,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        if !matches!(state, JobState::Failed | JobState::Abandoned) {
            anyhow::bail!("Jobs can only finish as failed or abandoned, not {}", state);
        }

        let job = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            UPDATE transcode_jobs
            SET state = $3,
                version = version + 1,
                last_error_kind = $4,
                last_error_message = $5,
                finished_at = $6,
                updated_at = $6
            WHERE id = $1 AND version = $2 AND state = 'running'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(expected_version)
        .bind(state.to_string())
        .bind(failure.kind.to_string())
        .bind(&failure.message)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to finish transcode job")?;
        Ok(job)
    }

    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs", db.record_id = %id))]
    async fn request_cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<TranscodeJob>> {
        let job = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            UPDATE transcode_jobs
            SET cancel_requested = TRUE,
                state = CASE WHEN state = 'queued' THEN 'failed' ELSE state END,
                version = CASE WHEN state = 'queued' THEN version + 1 ELSE version END,
                last_error_kind = CASE WHEN state = 'queued' THEN 'cancelled' ELSE last_error_kind END,
                last_error_message = CASE
                    WHEN state = 'queued' THEN 'Cancelled before start'
                    ELSE last_error_message
                END,
                finished_at = CASE WHEN state = 'queued' THEN $2 ELSE finished_at END,
                updated_at = $2
            WHERE id = $1 AND state IN ('queued', 'running')
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to request job cancellation")?;

        match job {
            Some(job) => Ok(Some(job)),
            None => self.get_job(id).await,
        }
    }

    async fn cancel_requested(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let cancelled = sqlx::query_scalar::<Postgres, Uuid>(
            "SELECT id FROM transcode_jobs WHERE id = ANY($1) AND cancel_requested AND state = 'running'",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to poll cancellation requests")?;
        Ok(cancelled)
    }

    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs"))]
    async fn stale_running(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TranscodeJob>> {
        let jobs = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            SELECT {}
            FROM transcode_jobs
            WHERE state = 'running' AND heartbeat_at < $1
            ORDER BY heartbeat_at ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(heartbeat_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stale jobs")?;
        Ok(jobs)
    }

    #[tracing::instrument(skip(self), fields(db.table = "transcode_jobs"))]
    async fn unpublished_succeeded(&self, limit: i64) -> Result<Vec<TranscodeJob>> {
        let columns = JOB_COLUMNS
            .split(", ")
            .map(|c| format!("j.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let jobs = sqlx::query_as::<Postgres, TranscodeJob>(&format!(
            r#"
            SELECT {}
            FROM transcode_jobs j
            JOIN recipe_videos v ON v.id = j.video_id
            WHERE j.state = 'succeeded'
              AND (
                  v.current_rendition_set IS NULL
                  OR EXISTS (
                      SELECT 1 FROM transcode_jobs c
                      WHERE c.id = v.current_rendition_set
                        AND c.id <> j.id
                        AND c.created_at < j.created_at
                  )
              )
            ORDER BY j.finished_at ASC
            LIMIT $1
            "#,
            columns
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unpublished jobs")?;
        Ok(jobs)
    }
}
