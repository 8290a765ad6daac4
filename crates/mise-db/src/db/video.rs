use anyhow::{Context, Result};
use async_trait::async_trait;
use mise_core::models::{BitrateLadder, RecipeVideo, Rendition, TranscodeJob};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::job::JobRepository;
use crate::store_traits::{SubmitOutcome, Submission, VideoStore};

pub(crate) const VIDEO_COLUMNS: &str = "id, recipe_id, ordinal, state, master_key, \
    current_rendition_set, manifest_key, uploaded_at, updated_at";

#[derive(Clone)]
pub struct VideoRepository {
    pool: PgPool,
}

impl VideoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_video(
        tx: &mut Transaction<'_, Postgres>,
        video_id: Uuid,
    ) -> Result<Option<RecipeVideo>> {
        sqlx::query_as::<Postgres, RecipeVideo>(&format!(
            "SELECT {} FROM recipe_videos WHERE id = $1 FOR UPDATE",
            VIDEO_COLUMNS
        ))
        .bind(video_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to lock recipe video")
    }

    async fn active_job_id(
        tx: &mut Transaction<'_, Postgres>,
        video_id: Uuid,
    ) -> Result<Option<Uuid>> {
        sqlx::query_scalar::<Postgres, Uuid>(
            "SELECT id FROM transcode_jobs WHERE video_id = $1 AND state IN ('queued', 'running')",
        )
        .bind(video_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to check for active job")
    }

    /// Insert `job`, notify workers and commit, or roll back with `Conflict` if the partial
    /// unique index reports another active job.
    async fn enqueue_in(
        &self,
        mut tx: Transaction<'_, Postgres>,
        video: RecipeVideo,
        job: TranscodeJob,
    ) -> Result<SubmitOutcome> {
        let inserted = JobRepository::insert_tx(&mut tx, &job).await?;
        let Some(job) = inserted else {
            tx.rollback().await.ok();
            let active_job_id = self.active_job_id_now(video.id).await?.unwrap_or(job.id);
            return Ok(SubmitOutcome::Conflict {
                video_id: video.id,
                active_job_id,
            });
        };

        // Non-fatal: workers poll if LISTEN/NOTIFY is unavailable.
        if let Err(e) = sqlx::query("SELECT pg_notify('mise_transcode_job', $1)")
            .bind(job.id.to_string())
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(
                error = %e,
                job.id = %job.id,
                "Failed to send pg_notify for new job, workers will discover it via polling"
            );
        }

        tx.commit()
            .await
            .context("Failed to commit transaction for job submission")?;

        tracing::info!(
            video.id = %video.id,
            job.id = %job.id,
            rungs = job.ladder.len(),
            "Transcode job queued"
        );

        Ok(SubmitOutcome::Accepted { video, job })
    }

    async fn active_job_id_now(&self, video_id: Uuid) -> Result<Option<Uuid>> {
        sqlx::query_scalar::<Postgres, Uuid>(
            "SELECT id FROM transcode_jobs WHERE video_id = $1 AND state IN ('queued', 'running')",
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check for active job")
    }
}

#[async_trait]
impl VideoStore for VideoRepository {
    #[tracing::instrument(skip(self), fields(db.table = "recipe_videos", db.record_id = %id))]
    async fn get_video(&self, id: Uuid) -> Result<Option<RecipeVideo>> {
        let video = sqlx::query_as::<Postgres, RecipeVideo>(&format!(
            "SELECT {} FROM recipe_videos WHERE id = $1",
            VIDEO_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch recipe video")?;
        Ok(video)
    }

    #[tracing::instrument(skip(self), fields(db.table = "recipe_videos"))]
    async fn find_video(&self, recipe_id: Uuid, ordinal: i32) -> Result<Option<RecipeVideo>> {
        let video = sqlx::query_as::<Postgres, RecipeVideo>(&format!(
            "SELECT {} FROM recipe_videos WHERE recipe_id = $1 AND ordinal = $2",
            VIDEO_COLUMNS
        ))
        .bind(recipe_id)
        .bind(ordinal)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch recipe video by ordinal")?;
        Ok(video)
    }

    #[tracing::instrument(skip(self, submission), fields(db.table = "recipe_videos", recipe.id = %submission.recipe_id, ordinal = submission.ordinal))]
    async fn submit(&self, submission: Submission) -> Result<SubmitOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for submission")?;

        let existing = sqlx::query_as::<Postgres, RecipeVideo>(&format!(
            "SELECT {} FROM recipe_videos WHERE recipe_id = $1 AND ordinal = $2 FOR UPDATE",
            VIDEO_COLUMNS
        ))
        .bind(submission.recipe_id)
        .bind(submission.ordinal)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock recipe video")?;

        let video = match existing {
            Some(video) => {
                if let Some(active_job_id) = Self::active_job_id(&mut tx, video.id).await? {
                    tx.rollback().await.ok();
                    return Ok(SubmitOutcome::Conflict {
                        video_id: video.id,
                        active_job_id,
                    });
                }

                // A ready video keeps serving its current renditions during the re-encode.
                sqlx::query_as::<Postgres, RecipeVideo>(&format!(
                    r#"
                    UPDATE recipe_videos
                    SET master_key = $2,
                        state = CASE WHEN state = 'ready' THEN 'ready' ELSE 'pending' END,
                        uploaded_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING {}
                    "#,
                    VIDEO_COLUMNS
                ))
                .bind(video.id)
                .bind(&submission.master_key)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to replace master of recipe video")?
            }
            None => {
                let inserted = sqlx::query_as::<Postgres, RecipeVideo>(&format!(
                    r#"
                    INSERT INTO recipe_videos (id, recipe_id, ordinal, state, master_key)
                    VALUES ($1, $2, $3, 'pending', $4)
                    ON CONFLICT (recipe_id, ordinal) DO NOTHING
                    RETURNING {}
                    "#,
                    VIDEO_COLUMNS
                ))
                .bind(Uuid::new_v4())
                .bind(submission.recipe_id)
                .bind(submission.ordinal)
                .bind(&submission.master_key)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to insert recipe video")?;

                match inserted {
                    Some(video) => video,
                    None => {
                        // A concurrent submission created the video (and its job) first.
                        tx.rollback().await.ok();
                        let video = self
                            .find_video(submission.recipe_id, submission.ordinal)
                            .await?
                            .context("Recipe video vanished after concurrent insert")?;
                        let active_job_id = self
                            .active_job_id_now(video.id)
                            .await?
                            .context("Concurrent submission left no active job")?;
                        return Ok(SubmitOutcome::Conflict {
                            video_id: video.id,
                            active_job_id,
                        });
                    }
                }
            }
        };

        let job = TranscodeJob::queued(
            video.id,
            submission.master_key,
            submission.ladder,
            submission.max_attempts,
        );
        self.enqueue_in(tx, video, job).await
    }

    #[tracing::instrument(skip(self, ladder), fields(db.table = "recipe_videos", db.record_id = %video_id))]
    async fn enqueue_retranscode(
        &self,
        video_id: Uuid,
        ladder: BitrateLadder,
        max_attempts: i32,
    ) -> Result<Option<SubmitOutcome>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for re-transcode")?;

        let Some(video) = Self::lock_video(&mut tx, video_id).await? else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        if let Some(active_job_id) = Self::active_job_id(&mut tx, video.id).await? {
            tx.rollback().await.ok();
            return Ok(Some(SubmitOutcome::Conflict {
                video_id,
                active_job_id,
            }));
        }

        let job = TranscodeJob::queued(video.id, video.master_key.clone(), ladder, max_attempts);
        self.enqueue_in(tx, video, job).await.map(Some)
    }

    #[tracing::instrument(skip(self), fields(db.table = "recipe_videos", db.record_id = %video_id))]
    async fn mark_transcoding(&self, video_id: Uuid) -> Result<Option<RecipeVideo>> {
        let updated = sqlx::query_as::<Postgres, RecipeVideo>(&format!(
            r#"
            UPDATE recipe_videos
            SET state = 'transcoding', updated_at = NOW()
            WHERE id = $1 AND state IN ('pending', 'failed')
            RETURNING {}
            "#,
            VIDEO_COLUMNS
        ))
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark recipe video transcoding")?;

        match updated {
            Some(video) => Ok(Some(video)),
            None => self.get_video(video_id).await,
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "recipe_videos", db.record_id = %video_id, job.id = %job_id))]
    async fn publish(
        &self,
        video_id: Uuid,
        job_id: Uuid,
        manifest_key: &str,
    ) -> Result<Option<RecipeVideo>> {
        let published = sqlx::query_as::<Postgres, RecipeVideo>(
            r#"
            UPDATE recipe_videos v
            SET current_rendition_set = j.id,
                manifest_key = $3,
                state = 'ready',
                updated_at = NOW()
            FROM transcode_jobs j
            WHERE v.id = $1
              AND j.id = $2
              AND j.video_id = v.id
              AND j.state = 'succeeded'
              AND (
                  v.current_rendition_set IS NULL
                  OR v.current_rendition_set = j.id
                  OR NOT EXISTS (
                      SELECT 1 FROM transcode_jobs c
                      WHERE c.id = v.current_rendition_set AND c.created_at > j.created_at
                  )
              )
            RETURNING v.id, v.recipe_id, v.ordinal, v.state, v.master_key,
                      v.current_rendition_set, v.manifest_key, v.uploaded_at, v.updated_at
            "#,
        )
        .bind(video_id)
        .bind(job_id)
        .bind(manifest_key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to publish rendition set")?;

        match published {
            Some(video) => {
                tracing::info!(
                    video.id = %video_id,
                    job.id = %job_id,
                    manifest_key = %manifest_key,
                    "Rendition set published"
                );
                Ok(Some(video))
            }
            None => self.get_video(video_id).await,
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "recipe_videos", db.record_id = %video_id))]
    async fn mark_failed(&self, video_id: Uuid) -> Result<Option<RecipeVideo>> {
        let updated = sqlx::query_as::<Postgres, RecipeVideo>(&format!(
            r#"
            UPDATE recipe_videos
            SET state = 'failed', updated_at = NOW()
            WHERE id = $1 AND current_rendition_set IS NULL
            RETURNING {}
            "#,
            VIDEO_COLUMNS
        ))
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark recipe video failed")?;

        match updated {
            Some(video) => Ok(Some(video)),
            None => self.get_video(video_id).await,
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "renditions"))]
    async fn renditions(&self, rendition_set_id: Uuid) -> Result<Vec<Rendition>> {
        let renditions = sqlx::query_as::<Postgres, Rendition>(
            r#"
            SELECT id, video_id, rendition_set_id, label, width, height, bitrate_kbps,
                   manifest_key, segment_keys, duration_ms, byte_size, created_at
            FROM renditions
            WHERE rendition_set_id = $1
            ORDER BY bitrate_kbps DESC
            "#,
        )
        .bind(rendition_set_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch renditions")?;
        Ok(renditions)
    }
}
