//! Repository trait abstractions
//!
//! The coordinator, worker pool and migration orchestrator depend on these traits rather
//! than on Postgres directly, so the same code runs against [`crate::memory::MemoryStore`]
//! in tests and development.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mise_core::models::{
    BackendId, BitrateLadder, JobProgress, JobState, MigrationRecord, MigrationState,
    MigrationTally, RecipeVideo, Rendition, TranscodeJob,
};
use mise_core::JobErrorKind;
use uuid::Uuid;

/// A stored master waiting for its first (or next) encode.
#[derive(Debug, Clone)]
pub struct Submission {
    pub recipe_id: Uuid,
    pub ordinal: i32,
    pub master_key: String,
    pub ladder: BitrateLadder,
    pub max_attempts: i32,
}

/// Result of trying to enqueue a job for a video.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted {
        video: RecipeVideo,
        job: TranscodeJob,
    },
    /// A job is already queued or running for the video; nothing was changed.
    Conflict { video_id: Uuid, active_job_id: Uuid },
}

/// How a job attempt ended, as recorded by [`JobStore::finish`].
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub kind: JobErrorKind,
    pub message: String,
}

#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn get_video(&self, id: Uuid) -> Result<Option<RecipeVideo>>;

    async fn find_video(&self, recipe_id: Uuid, ordinal: i32) -> Result<Option<RecipeVideo>>;

    /// Create the video for `(recipe_id, ordinal)` or point an existing one at a new master,
    /// and enqueue its job, in one atomic step. Rejected with `Conflict` while another job for
    /// the video is active.
    async fn submit(&self, submission: Submission) -> Result<SubmitOutcome>;

    /// Enqueue a re-encode of the video's current master.
    async fn enqueue_retranscode(
        &self,
        video_id: Uuid,
        ladder: BitrateLadder,
        max_attempts: i32,
    ) -> Result<Option<SubmitOutcome>>;

    /// `pending`/`failed` → `transcoding`. Ready videos keep serving while re-encoding.
    async fn mark_transcoding(&self, video_id: Uuid) -> Result<Option<RecipeVideo>>;

    /// Point the video at the renditions of succeeded job `job_id` and mark it `ready`.
    /// Idempotent; an older job never replaces a newer published set.
    async fn publish(
        &self,
        video_id: Uuid,
        job_id: Uuid,
        manifest_key: &str,
    ) -> Result<Option<RecipeVideo>>;

    /// Mark the video `failed` unless it already serves published renditions.
    async fn mark_failed(&self, video_id: Uuid) -> Result<Option<RecipeVideo>>;

    async fn renditions(&self, rendition_set_id: Uuid) -> Result<Vec<Rendition>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: Uuid) -> Result<Option<TranscodeJob>>;

    async fn active_job(&self, video_id: Uuid) -> Result<Option<TranscodeJob>>;

    async fn latest_job(&self, video_id: Uuid) -> Result<Option<TranscodeJob>>;

    /// Oldest queued jobs whose `not_before` has passed.
    async fn claim_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TranscodeJob>>;

    /// `queued` → `running` if the job is still at `expected_version`. Increments the attempt
    /// count. `None` means another worker won the race.
    async fn try_claim(
        &self,
        id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>>;

    /// Record progress for a running job without bumping its version. Returns whether the job
    /// is still running.
    async fn heartbeat(&self, id: Uuid, progress: JobProgress, now: DateTime<Utc>) -> Result<bool>;

    /// `running` → `succeeded`, inserting `renditions` in the same transaction.
    async fn complete(
        &self,
        id: Uuid,
        expected_version: i64,
        renditions: &[Rendition],
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>>;

    /// `running` → `queued` for another attempt no earlier than `not_before`.
    async fn requeue(
        &self,
        id: Uuid,
        expected_version: i64,
        failure: JobFailure,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>>;

    /// `running` → `failed` or `abandoned`.
    async fn finish(
        &self,
        id: Uuid,
        expected_version: i64,
        state: JobState,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<TranscodeJob>>;

    /// Queued jobs fail immediately with `cancelled`; running jobs are flagged for their
    /// worker. Returns the job after the change, or `None` if it does not exist.
    async fn request_cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<TranscodeJob>>;

    /// Subset of `ids` whose cancellation has been requested.
    async fn cancel_requested(&self, ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Running jobs whose last heartbeat is older than `heartbeat_before`.
    async fn stale_running(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TranscodeJob>>;

    /// Succeeded jobs newer than the set their video currently serves.
    async fn unpublished_succeeded(&self, limit: i64) -> Result<Vec<TranscodeJob>>;
}

#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn create_migration(
        &self,
        source: &BackendId,
        dest: &BackendId,
        prefix: &str,
    ) -> Result<MigrationRecord>;

    async fn get_migration(&self, id: Uuid) -> Result<Option<MigrationRecord>>;

    /// Move the cursor forward and add `tally` to the counters.
    async fn advance_migration(
        &self,
        id: Uuid,
        cursor: Option<&str>,
        tally: MigrationTally,
    ) -> Result<MigrationRecord>;

    async fn set_migration_state(&self, id: Uuid, state: MigrationState) -> Result<MigrationRecord>;

    /// Start a new scan pass of a finished migration: cursor cleared, failure count reset.
    async fn restart_migration(&self, id: Uuid) -> Result<MigrationRecord>;
}
