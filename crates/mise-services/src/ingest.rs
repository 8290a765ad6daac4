//! Ingest coordinator: accepts uploaded masters, creates transcode jobs, and publishes
//! rendition sets when jobs succeed.
//!
//! At most one job is active per video. A submission while a job is queued or running is
//! rejected with `Conflict`; the check runs once before the master is stored (so large
//! uploads are not staged for nothing) and again atomically when the job row is inserted.

use anyhow::Context;
use mise_core::models::{BitrateLadder, JobState, RecipeVideo, TranscodeJob};
use mise_core::AppError;
use mise_db::{JobStore, SubmitOutcome, Submission, VideoStore};
use mise_storage::{keys, ByteReader, ObjectStoreAdapter};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::storage_app_error;

const RECONCILE_BATCH: i64 = 100;

/// A master file as received from the uploader.
pub struct MasterUpload {
    pub recipe_id: Uuid,
    pub ordinal: i32,
    /// Requested ladder; the configured default when absent.
    pub ladder: Option<BitrateLadder>,
    pub content_type: String,
    pub body: ByteReader,
}

/// What the status query reports for one video.
#[derive(Debug, Clone)]
pub struct VideoStatus {
    pub video: RecipeVideo,
    /// Most recent job, active or not.
    pub latest_job: Option<TranscodeJob>,
}

impl VideoStatus {
    /// Manifest key players should request, once the video is ready.
    pub fn manifest_key(&self) -> Option<&str> {
        self.video.manifest_key.as_deref()
    }

    pub fn active_job(&self) -> Option<&TranscodeJob> {
        self.latest_job.as_ref().filter(|j| j.state.is_active())
    }
}

pub struct IngestCoordinator {
    videos: Arc<dyn VideoStore>,
    jobs: Arc<dyn JobStore>,
    storage: Arc<ObjectStoreAdapter>,
    default_ladder: BitrateLadder,
    max_attempts: i32,
}

fn conflict(video_id: Uuid, active_job_id: Uuid) -> AppError {
    AppError::Conflict(format!(
        "Video {} already has active transcode job {}",
        video_id, active_job_id
    ))
}

impl IngestCoordinator {
    pub fn new(
        videos: Arc<dyn VideoStore>,
        jobs: Arc<dyn JobStore>,
        storage: Arc<ObjectStoreAdapter>,
        default_ladder: BitrateLadder,
        max_attempts: i32,
    ) -> Self {
        Self {
            videos,
            jobs,
            storage,
            default_ladder,
            max_attempts,
        }
    }

    /// Store the master and queue its transcode. Re-uploading an existing `(recipe, ordinal)`
    /// replaces the master and re-encodes; a ready video keeps serving meanwhile.
    #[tracing::instrument(skip(self, upload), fields(recipe.id = %upload.recipe_id, ordinal = upload.ordinal))]
    pub async fn submit(&self, upload: MasterUpload) -> Result<RecipeVideo, AppError> {
        if upload.ordinal < 0 {
            return Err(AppError::InvalidInput("ordinal must not be negative".to_string()));
        }
        if let Some(existing) = self.videos.find_video(upload.recipe_id, upload.ordinal).await? {
            if let Some(active) = self.jobs.active_job(existing.id).await? {
                return Err(conflict(existing.id, active.id));
            }
        }

        let master_key = keys::master_key(upload.recipe_id, upload.ordinal, Uuid::new_v4());
        let start = std::time::Instant::now();
        let stored = self
            .storage
            .put_stream(&master_key, upload.body, &upload.content_type)
            .await
            .map_err(storage_app_error)?;
        tracing::info!(
            key = %master_key,
            size_bytes = stored.size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Master stored"
        );

        let submission = Submission {
            recipe_id: upload.recipe_id,
            ordinal: upload.ordinal,
            master_key: master_key.clone(),
            ladder: upload.ladder.unwrap_or_else(|| self.default_ladder.clone()),
            max_attempts: self.max_attempts,
        };
        let outcome = match self.videos.submit(submission).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard_master(&master_key).await;
                return Err(e.into());
            }
        };

        match outcome {
            SubmitOutcome::Accepted { video, job } => {
                tracing::info!(video.id = %video.id, job.id = %job.id, "Transcode job queued");
                Ok(video)
            }
            SubmitOutcome::Conflict {
                video_id,
                active_job_id,
            } => {
                self.discard_master(&master_key).await;
                Err(conflict(video_id, active_job_id))
            }
        }
    }

    async fn discard_master(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            tracing::warn!(error = %e, key = %key, "Failed to remove staged master");
        }
    }

    pub async fn status(&self, video_id: Uuid) -> Result<VideoStatus, AppError> {
        let video = self
            .videos
            .get_video(video_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Video {} not found", video_id)))?;
        let latest_job = self.jobs.latest_job(video_id).await?;
        Ok(VideoStatus { video, latest_job })
    }

    /// Re-encode the current master, e.g. with a new ladder.
    #[tracing::instrument(skip(self, ladder), fields(video.id = %video_id))]
    pub async fn retranscode(
        &self,
        video_id: Uuid,
        ladder: Option<BitrateLadder>,
    ) -> Result<TranscodeJob, AppError> {
        let ladder = ladder.unwrap_or_else(|| self.default_ladder.clone());
        match self
            .videos
            .enqueue_retranscode(video_id, ladder, self.max_attempts)
            .await?
        {
            None => Err(AppError::NotFound(format!("Video {} not found", video_id))),
            Some(SubmitOutcome::Conflict {
                video_id,
                active_job_id,
            }) => Err(conflict(video_id, active_job_id)),
            Some(SubmitOutcome::Accepted { job, .. }) => {
                tracing::info!(job.id = %job.id, "Re-transcode queued");
                Ok(job)
            }
        }
    }

    pub async fn job(&self, job_id: Uuid) -> Result<TranscodeJob, AppError> {
        self.jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))
    }

    /// A worker claimed the job's first (or next) attempt.
    pub async fn on_job_started(&self, job: &TranscodeJob) -> anyhow::Result<()> {
        self.videos
            .mark_transcoding(job.video_id)
            .await
            .with_context(|| format!("Failed to mark video {} transcoding", job.video_id))?;
        Ok(())
    }

    /// Record the terminal outcome of a job on its video.
    ///
    /// Success publishes the job's whole rendition set in one step; failure marks the video
    /// `failed` only when it has nothing published, so older renditions keep serving.
    #[tracing::instrument(skip(self, job), fields(job.id = %job.id, video.id = %job.video_id, state = %job.state))]
    pub async fn on_job_completed(&self, job: &TranscodeJob) -> anyhow::Result<()> {
        match job.state {
            JobState::Succeeded => {
                let prefix = keys::rendition_prefix(job.video_id, job.id, job.attempt_count);
                let manifest_key = keys::master_playlist_key(&prefix);
                if self.storage.lookup(&manifest_key).await?.is_none() {
                    anyhow::bail!(
                        "Master playlist {} of succeeded job {} is missing",
                        manifest_key,
                        job.id
                    );
                }
                let video = self
                    .videos
                    .publish(job.video_id, job.id, &manifest_key)
                    .await
                    .context("Failed to publish renditions")?;
                match video {
                    Some(video) if video.current_rendition_set == Some(job.id) => {
                        tracing::info!(manifest_key = %manifest_key, "Renditions published")
                    }
                    Some(_) => tracing::info!("Newer renditions already published, skipping"),
                    None => tracing::warn!("Video vanished before publish"),
                }
            }
            JobState::Failed | JobState::Abandoned => {
                let video = self
                    .videos
                    .mark_failed(job.video_id)
                    .await
                    .context("Failed to record job failure")?;
                if let Some(video) = video {
                    tracing::warn!(
                        video.state = %video.state,
                        error_kind = ?job.last_error_kind,
                        "Transcode job did not succeed"
                    );
                }
            }
            JobState::Queued | JobState::Running => {
                tracing::debug!("Job not finished, nothing to record");
            }
        }
        Ok(())
    }

    /// Publish succeeded jobs whose completion was never recorded, e.g. after a crash
    /// between the job update and the publish. Returns how many were handled.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let pending = self.jobs.unpublished_succeeded(RECONCILE_BATCH).await?;
        let mut handled = 0;
        for job in pending {
            match self.on_job_completed(&job).await {
                Ok(()) => handled += 1,
                Err(e) => tracing::error!(error = %e, job.id = %job.id, "Failed to reconcile job"),
            }
        }
        if handled > 0 {
            tracing::info!(handled, "Reconciled unpublished jobs");
        }
        Ok(handled)
    }
}
