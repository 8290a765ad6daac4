//! In-process store with the same transition semantics as the Postgres repositories.
//!
//! Every method takes one lock over all tables, which gives the atomicity the SQL versions
//! get from transactions and conditional updates. Used with `STORE=memory` and by the
//! integration suites of the downstream crates.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mise_core::models::{
    BackendId, BitrateLadder, JobProgress, JobState, MigrationRecord, MigrationState,
    MigrationTally, RecipeVideo, Rendition, TranscodeJob, VideoState,
};
use mise_core::JobErrorKind;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::store_traits::{
    JobFailure, JobStore, MigrationStore, SubmitOutcome, Submission, VideoStore,
};

#[derive(Default)]
struct Tables {
    videos: HashMap<Uuid, RecipeVideo>,
    jobs: HashMap<Uuid, TranscodeJob>,
    renditions: Vec<Rendition>,
    migrations: HashMap<Uuid, MigrationRecord>,
}

impl Tables {
    fn active_job(&self, video_id: Uuid) -> Option<&TranscodeJob> {
        self.jobs
            .values()
            .find(|j| j.video_id == video_id && j.state.is_active())
    }

    /// Whether succeeded job `job` may replace what `video` currently serves.
    fn supersedes_current(&self, video: &RecipeVideo, job: &TranscodeJob) -> bool {
        match video.current_rendition_set {
            None => true,
            Some(current) if current == job.id => true,
            Some(current) => self
                .jobs
                .get(&current)
                .is_none_or(|c| c.created_at <= job.created_at),
        }
    }

    fn enqueue(&mut self, video: RecipeVideo, job: TranscodeJob) -> SubmitOutcome {
        if let Some(active) = self.active_job(video.id) {
            return SubmitOutcome::Conflict {
                video_id: video.id,
                active_job_id: active.id,
            };
        }
        self.jobs.insert(job.id, job.clone());
        SubmitOutcome::Accepted { video, job }
    }

    fn running_mut(&mut self, id: Uuid, expected_version: i64) -> Option<&mut TranscodeJob> {
        self.jobs
            .get_mut(&id)
            .filter(|j| j.state == JobState::Running && j.version == expected_version)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every job stored for a video, oldest first.
    pub fn jobs_for(&self, video_id: Uuid) -> Vec<TranscodeJob> {
        let mut jobs: Vec<TranscodeJob> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.video_id == video_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Overwrite a job's heartbeat, for simulating crashed workers.
    pub fn set_heartbeat(&self, id: Uuid, heartbeat_at: Option<DateTime<Utc>>) {
        if let Some(job) = self.lock().jobs.get_mut(&id) {
            job.heartbeat_at = heartbeat_at;
        }
    }
}

#[async_trait]
impl VideoStore for MemoryStore {
    async fn get_video(&self, id: Uuid) -> Result<Option<RecipeVideo>> {
        Ok(self.lock().videos.get(&id).cloned())
    }

    async fn find_video(&self, recipe_id: Uuid, ordinal: i32) -> Result<Option<RecipeVideo>> {
        Ok(self
            .lock()
            .videos
            .values()
            .find(|v| v.recipe_id == recipe_id && v.ordinal == ordinal)
            .cloned())
    }

    async fn submit(&self, submission: Submission) -> Result<SubmitOutcome> {
        let mut tables = self.lock();
        let now = Utc::now();

        let existing = tables
            .videos
            .values()
            .find(|v| v.recipe_id == submission.recipe_id && v.ordinal == submission.ordinal)
            .map(|v| v.id);

        let video_id = match existing {
            Some(id) => {
                if let Some(active) = tables.active_job(id) {
                    return Ok(SubmitOutcome::Conflict {
                        video_id: id,
                        active_job_id: active.id,
                    });
                }
                if let Some(video) = tables.videos.get_mut(&id) {
                    video.master_key = submission.master_key.clone();
                    if video.state != VideoState::Ready {
                        video.state = VideoState::Pending;
                    }
                    video.uploaded_at = now;
                    video.updated_at = now;
                }
                id
            }
            None => {
                let video = RecipeVideo {
                    id: Uuid::new_v4(),
                    recipe_id: submission.recipe_id,
                    ordinal: submission.ordinal,
                    state: VideoState::Pending,
                    master_key: submission.master_key.clone(),
                    current_rendition_set: None,
                    manifest_key: None,
                    uploaded_at: now,
                    updated_at: now,
                };
                let id = video.id;
                tables.videos.insert(id, video);
                id
            }
        };

        let Some(video) = tables.videos.get(&video_id).cloned() else {
            bail!("Video {} vanished during submission", video_id);
        };
        let job = TranscodeJob::queued(
            video_id,
            submission.master_key,
            submission.ladder,
            submission.max_attempts,
        );
        Ok(tables.enqueue(video, job))
    }

    async fn enqueue_retranscode(
        &self,
        video_id: Uuid,
        ladder: BitrateLadder,
        max_attempts: i32,
    ) -> Result<Option<SubmitOutcome>> {
        let mut tables = self.lock();
        let Some(video) = tables.videos.get(&video_id).cloned() else {
            return Ok(None);
        };
        let job = TranscodeJob::queued(video_id, video.master_key.clone(), ladder, max_attempts);
        Ok(Some(tables.enqueue(video, job)))
    }

    async fn mark_transcoding(&self, video_id: Uuid) -> Result<Option<RecipeVideo>> {
        let mut tables = self.lock();
        Ok(tables.videos.get_mut(&video_id).map(|video| {
            if matches!(video.state, VideoState::Pending | VideoState::Failed) {
                video.state = VideoState::Transcoding;
                video.updated_at = Utc::now();
            }
            video.clone()
        }))
    }

    async fn publish(
        &self,
        video_id: Uuid,
        job_id: Uuid,
        manifest_key: &str,
    ) -> Result<Option<RecipeVideo>> {
        let mut tables = self.lock();
        let Some(video) = tables.videos.get(&video_id).cloned() else {
            return Ok(None);
        };
        let eligible = tables.jobs.get(&job_id).is_some_and(|job| {
            job.video_id == video_id
                && job.state == JobState::Succeeded
                && tables.supersedes_current(&video, job)
        });
        if !eligible {
            return Ok(Some(video));
        }

        let Some(video) = tables.videos.get_mut(&video_id) else {
            return Ok(None);
        };
        video.current_rendition_set = Some(job_id);
        video.manifest_key = Some(manifest_key.to_string());
        video.state = VideoState::Ready;
        video.updated_at = Utc::now();
        Ok(Some(video.clone()))
    }

    async fn mark_failed(&self, video_id: Uuid) -> Result<Option<RecipeVideo>> {
        let mut tables = self.lock();
        Ok(tables.videos.get_mut(&video_id).map(|video| {
            if video.current_rendition_set.is_none() {
                video.state = VideoState::Failed;
                video.updated_at = Utc::now();
            }
            video.clone()
        }))
    }

    async fn renditions(&self, rendition_set_id: Uuid) -> Result<Vec<Rendition>> {
        let mut renditions: Vec<Rendition> = self
            .lock()
            .renditions
            .iter()
            .filter(|r| r.rendition_set_id == rendition_set_id)
            .cloned()
            .collect();
        renditions.sort_by(|a, b| b.bitrate_kbps.cmp(&a.bitrate_kbps));
        Ok(renditions)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get_job(&self, id: Uuid) -> Result<Option<TranscodeJob>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn active_job(&self, video_id: Uuid) -> Result<Option<TranscodeJob>> {
        Ok(self.lock().active_job(video_id).cloned())
    }

    async fn latest_job(&self, video_id: Uuid) -> Result<Option<TranscodeJob>> {
        Ok(self.jobs_for(video_id).pop())
    }

    async fn claim_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TranscodeJob>> {
        let mut jobs: Vec<TranscodeJob> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.not_before, j.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        let mut tables = self.lock();
        let Some(job) = tables
            .jobs
            .get_mut(&id)
            .filter(|j| j.state == JobState::Queued && j.version == expected_version)
        else {
            return Ok(None);
        };
        job.state = JobState::Running;
        job.version += 1;
        job.attempt_count += 1;
        job.progress = JobProgress {
            renditions_total: job.progress.renditions_total,
            ..JobProgress::default()
        };
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, id: Uuid, progress: JobProgress, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.lock();
        match tables.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Running => {
                job.progress = JobProgress {
                    renditions_total: job.progress.renditions_total,
                    ..progress
                };
                job.heartbeat_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        expected_version: i64,
        renditions: &[Rendition],
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        let mut tables = self.lock();
        let Some(job) = tables.running_mut(id, expected_version) else {
            return Ok(None);
        };
        job.state = JobState::Succeeded;
        job.version += 1;
        job.progress.renditions_done = job.progress.renditions_total;
        job.cancel_requested = false;
        job.heartbeat_at = Some(now);
        job.finished_at = Some(now);
        job.updated_at = now;
        let job = job.clone();
        tables.renditions.extend_from_slice(renditions);
        Ok(Some(job))
    }

    async fn requeue(
        &self,
        id: Uuid,
        expected_version: i64,
        failure: JobFailure,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        let mut tables = self.lock();
        let Some(job) = tables.running_mut(id, expected_version) else {
            return Ok(None);
        };
        job.state = JobState::Queued;
        job.version += 1;
        job.last_error_kind = Some(failure.kind);
        job.last_error_message = Some(failure.message);
        job.not_before = not_before;
        job.heartbeat_at = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn finish(
        &self,
        id: Uuid,
        expected_version: i64,
        state: JobState,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>> {
        if !matches!(state, JobState::Failed | JobState::Abandoned) {
            bail!("Jobs can only finish as failed or abandoned, not {}", state);
        }
        let mut tables = self.lock();
        let Some(job) = tables.running_mut(id, expected_version) else {
            return Ok(None);
        };
        job.state = state;
        job.version += 1;
        job.last_error_kind = Some(failure.kind);
        job.last_error_message = Some(failure.message);
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn request_cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<TranscodeJob>> {
        let mut tables = self.lock();
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        match job.state {
            JobState::Queued => {
                job.state = JobState::Failed;
                job.version += 1;
                job.cancel_requested = true;
                job.last_error_kind = Some(JobErrorKind::Cancelled);
                job.last_error_message = Some("Cancelled before start".to_string());
                job.finished_at = Some(now);
                job.updated_at = now;
            }
            JobState::Running => {
                job.cancel_requested = true;
                job.updated_at = now;
            }
            _ => {}
        }
        Ok(Some(job.clone()))
    }

    async fn cancel_requested(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let tables = self.lock();
        Ok(ids
            .iter()
            .filter(|id| {
                tables
                    .jobs
                    .get(id)
                    .is_some_and(|j| j.cancel_requested && j.state == JobState::Running)
            })
            .copied()
            .collect())
    }

    async fn stale_running(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TranscodeJob>> {
        let mut jobs: Vec<TranscodeJob> = self
            .lock()
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Running
                    && j.heartbeat_at.is_some_and(|h| h < heartbeat_before)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.heartbeat_at);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn unpublished_succeeded(&self, limit: i64) -> Result<Vec<TranscodeJob>> {
        let tables = self.lock();
        let mut jobs: Vec<TranscodeJob> = tables
            .jobs
            .values()
            .filter(|j| j.state == JobState::Succeeded)
            .filter(|j| {
                tables.videos.get(&j.video_id).is_some_and(|v| {
                    v.current_rendition_set != Some(j.id) && tables.supersedes_current(v, j)
                })
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.finished_at);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    async fn create_migration(
        &self,
        source: &BackendId,
        dest: &BackendId,
        prefix: &str,
    ) -> Result<MigrationRecord> {
        let now = Utc::now();
        let record = MigrationRecord {
            id: Uuid::new_v4(),
            source: source.clone(),
            dest: dest.clone(),
            prefix: prefix.to_string(),
            state: MigrationState::Running,
            cursor: None,
            copied: 0,
            skipped: 0,
            failed: 0,
            created_at: now,
            updated_at: now,
        };
        self.lock().migrations.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_migration(&self, id: Uuid) -> Result<Option<MigrationRecord>> {
        Ok(self.lock().migrations.get(&id).cloned())
    }

    async fn advance_migration(
        &self,
        id: Uuid,
        cursor: Option<&str>,
        tally: MigrationTally,
    ) -> Result<MigrationRecord> {
        let mut tables = self.lock();
        let Some(record) = tables.migrations.get_mut(&id) else {
            bail!("Migration {} not found", id);
        };
        record.cursor = cursor.map(str::to_string);
        record.copied += tally.copied;
        record.skipped += tally.skipped;
        record.failed += tally.failed;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn set_migration_state(&self, id: Uuid, state: MigrationState) -> Result<MigrationRecord> {
        let mut tables = self.lock();
        let Some(record) = tables.migrations.get_mut(&id) else {
            bail!("Migration {} not found", id);
        };
        record.state = state;
        if state != MigrationState::Running {
            record.cursor = None;
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn restart_migration(&self, id: Uuid) -> Result<MigrationRecord> {
        let mut tables = self.lock();
        let Some(record) = tables.migrations.get_mut(&id) else {
            bail!("Migration {} not found", id);
        };
        record.state = MigrationState::Running;
        record.cursor = None;
        record.failed = 0;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}
