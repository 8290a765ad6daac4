//! Transcode worker pool: bounded workers, LISTEN/NOTIFY or polling, CAS claims, retry,
//! cancellation and the stale job reaper.
//!
//! Claims are compare-and-swap transitions on the job row, so any number of pools (in one
//! process or many) can share a store and every attempt still runs on exactly one worker.
//!
//! Shutdown: [`TranscodeWorkerPool::shutdown`] stops claiming and waits a bounded time for
//! in-flight jobs. Jobs still running when the process exits are requeued by the reaper of
//! the next pool to start.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mise_core::models::{JobProgress, JobState, TranscodeJob};
use mise_core::{JobError, JobErrorKind, TranscodeSettings};
use mise_db::{JobFailure, JobStore};
use mise_processing::{ProgressSink, TranscodeOutput};

use crate::context::JobExecutor;

/// Channel name for PostgreSQL LISTEN/NOTIFY when a job is queued.
pub const JOB_NOTIFY_CHANNEL: &str = "mise_transcode_job";

/// Upper bound on the delay before a failed attempt is retried.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Candidates fetched per claim round; losing a race moves on to the next one.
const CLAIM_BATCH: i64 = 8;

const REAP_BATCH: i64 = 100;

/// Backoff before attempt `attempt + 1`: `unit * 2^attempt`, capped.
pub(crate) fn compute_retry_backoff(attempt: i32, unit: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.clamp(0, 31) as u32);
    unit.saturating_mul(factor)
        .min(Duration::from_secs(MAX_RETRY_BACKOFF_SECS))
}

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Hard wall clock per attempt.
    pub job_timeout: Duration,
    /// Zero disables the reaper.
    pub stale_reap_interval: Duration,
    /// Added to `job_timeout` before a silent running job is considered orphaned.
    pub stale_grace: Duration,
    /// How often the store is checked for cancellations requested elsewhere.
    pub cancel_poll_interval: Duration,
    pub retry_backoff_unit: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            poll_interval: Duration::from_millis(1000),
            job_timeout: Duration::from_secs(7200),
            stale_reap_interval: Duration::from_secs(60),
            stale_grace: Duration::from_secs(300),
            cancel_poll_interval: Duration::from_secs(2),
            retry_backoff_unit: Duration::from_secs(1),
        }
    }
}

impl From<&TranscodeSettings> for WorkerPoolConfig {
    fn from(settings: &TranscodeSettings) -> Self {
        Self {
            max_workers: settings.max_workers,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            job_timeout: Duration::from_secs(settings.job_timeout_secs),
            stale_reap_interval: Duration::from_secs(settings.stale_reap_interval_secs),
            stale_grace: Duration::from_secs(settings.stale_grace_secs.max(0) as u64),
            ..Self::default()
        }
    }
}

/// Writes progress as a heartbeat on the job row.
struct HeartbeatSink {
    jobs: Arc<dyn JobStore>,
    job_id: Uuid,
}

#[async_trait]
impl ProgressSink for HeartbeatSink {
    async fn report(&self, progress: JobProgress) {
        match self.jobs.heartbeat(self.job_id, progress, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job.id = %self.job_id, "Heartbeat for job that is no longer running")
            }
            Err(e) => tracing::warn!(error = %e, job.id = %self.job_id, "Failed to record progress"),
        }
    }
}

struct Shared {
    jobs: Arc<dyn JobStore>,
    config: WorkerPoolConfig,
    executor: Weak<dyn JobExecutor>,
    semaphore: Arc<Semaphore>,
    /// Cancellation tokens of attempts running in this pool.
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Shared {
    fn register(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, token.clone());
        token
    }

    fn unregister(&self, job_id: Uuid) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    fn running_ids(&self) -> Vec<Uuid> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    fn signal_cancel(&self, job_id: Uuid) -> bool {
        match self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn notify_finished(&self, job: &TranscodeJob) {
        match self.executor.upgrade() {
            Some(executor) => executor.job_finished(job).await,
            None => tracing::warn!(job.id = %job.id, "Executor dropped, finish not delivered"),
        }
    }
}

#[derive(Clone)]
pub struct TranscodeWorkerPool {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl TranscodeWorkerPool {
    /// Start the pool with a weak reference to the executor.
    ///
    /// If `listen_pool` is `Some`, the claim loop also wakes on PostgreSQL NOTIFY when a job
    /// is queued, in addition to polling every `poll_interval`.
    pub fn start(
        jobs: Arc<dyn JobStore>,
        config: WorkerPoolConfig,
        executor: Weak<dyn JobExecutor>,
        listen_pool: Option<sqlx::PgPool>,
    ) -> Self {
        let shared = Arc::new(Shared {
            jobs,
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            config,
            executor,
            running: Mutex::new(HashMap::new()),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::claim_loop(
            shared.clone(),
            shutdown.clone(),
            listen_pool,
        ));
        if !shared.config.stale_reap_interval.is_zero() {
            tokio::spawn(Self::reaper_loop(shared.clone(), shutdown.clone()));
        }
        tokio::spawn(Self::cancel_watch_loop(shared.clone(), shutdown.clone()));

        Self { shared, shutdown }
    }

    async fn claim_loop(
        shared: Arc<Shared>,
        shutdown: CancellationToken,
        listen_pool: Option<sqlx::PgPool>,
    ) {
        tracing::info!(
            max_workers = shared.config.max_workers,
            poll_interval_ms = shared.config.poll_interval.as_millis() as u64,
            listen_notify = listen_pool.is_some(),
            "Transcode worker pool started"
        );

        // Channel to wake the loop when LISTEN receives a NOTIFY.
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        if let Some(pool) = listen_pool {
            let tx = notify_tx.clone();
            let listener_shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = Self::listen(pool, tx) => {}
                    _ = listener_shutdown.cancelled() => {}
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Transcode worker pool shutting down");
                    break;
                }
                _ = notify_rx.recv() => {}
                _ = sleep(shared.config.poll_interval) => {}
            }
            while Self::claim_and_dispatch_one(&shared).await {}
        }

        tracing::info!("Transcode worker pool stopped");
    }

    async fn listen(pool: sqlx::PgPool, tx: mpsc::Sender<()>) {
        loop {
            match sqlx::postgres::PgListener::connect_with(&pool).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen(JOB_NOTIFY_CHANNEL).await {
                        tracing::warn!(error = %e, "LISTEN failed, will retry");
                        sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                    while listener.recv().await.is_ok() {
                        let _ = tx.send(()).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "PgListener connect failed, will retry");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Claim one job if a worker slot is free. Returns whether a job was dispatched.
    async fn claim_and_dispatch_one(shared: &Arc<Shared>) -> bool {
        let permit = match shared.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::trace!("No workers available, skipping claim");
                return false;
            }
        };

        let now = Utc::now();
        let candidates = match shared.jobs.claim_candidates(now, CLAIM_BATCH).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list claimable jobs");
                return false;
            }
        };

        for candidate in candidates {
            match shared.jobs.try_claim(candidate.id, candidate.version, now).await {
                Ok(Some(job)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = Self::process_job(shared, job).await {
                            tracing::error!(error = %e, "Failed to record job outcome");
                        }
                    });
                    return true;
                }
                Ok(None) => {
                    tracing::debug!(job.id = %candidate.id, "Lost claim race, trying next candidate");
                }
                Err(e) => {
                    tracing::error!(error = %e, job.id = %candidate.id, "Failed to claim job");
                    return false;
                }
            }
        }
        tracing::trace!("No jobs available");
        false
    }

    #[tracing::instrument(skip(shared, job), fields(
        job.id = %job.id,
        video.id = %job.video_id,
        attempt = job.attempt_count
    ))]
    async fn process_job(shared: Arc<Shared>, job: TranscodeJob) -> Result<()> {
        let Some(executor) = shared.executor.upgrade() else {
            tracing::warn!("Executor dropped, returning job to the queue");
            let failure = JobFailure {
                kind: JobErrorKind::Transient,
                message: "Worker shutting down".to_string(),
            };
            let now = Utc::now();
            shared.jobs.requeue(job.id, job.version, failure, now, now).await?;
            return Ok(());
        };

        let token = shared.register(job.id);
        executor.clone().job_started(&job).await;

        let start = std::time::Instant::now();
        let sink = HeartbeatSink {
            jobs: shared.jobs.clone(),
            job_id: job.id,
        };
        let timeout = shared.config.job_timeout;
        let run = executor.clone().execute(&job, &sink, token.clone());
        tokio::pin!(run);

        let outcome = match tokio::time::timeout(timeout, &mut run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "Job attempt timed out, stopping encoder");
                token.cancel();
                // Let the executor stop the encoder and discard its output before settling.
                let _ = run.await;
                Err(JobError::timeout(timeout.as_secs()))
            }
        };
        shared.unregister(job.id);

        tracing::info!(
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            success = outcome.is_ok(),
            "Job attempt finished"
        );
        Self::settle(&shared, &job, outcome).await
    }

    /// Record the attempt outcome with a CAS on the claimed version.
    async fn settle(
        shared: &Shared,
        job: &TranscodeJob,
        outcome: Result<TranscodeOutput, JobError>,
    ) -> Result<()> {
        let now = Utc::now();
        let error = match outcome {
            Ok(output) => {
                match shared
                    .jobs
                    .complete(job.id, job.version, &output.renditions, now)
                    .await?
                {
                    Some(done) => {
                        tracing::info!(renditions = output.renditions.len(), "Job succeeded");
                        shared.notify_finished(&done).await;
                    }
                    None => tracing::warn!(
                        prefix = %output.prefix,
                        "Job changed while running, output not recorded"
                    ),
                }
                return Ok(());
            }
            Err(e) => e,
        };

        let failure = JobFailure {
            kind: error.kind(),
            message: error.to_string(),
        };
        tracing::error!(
            error = %error,
            error_kind = %error.kind(),
            attempt = job.attempt_count,
            max_attempts = job.max_attempts,
            "Job attempt failed"
        );

        let terminal_state = match error.kind() {
            JobErrorKind::Cancelled => Some(JobState::Failed),
            JobErrorKind::Fatal => Some(JobState::Abandoned),
            _ if job.can_retry() => None,
            _ => Some(JobState::Abandoned),
        };

        match terminal_state {
            None => {
                let backoff = compute_retry_backoff(job.attempt_count, shared.config.retry_backoff_unit);
                let not_before = now + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
                tracing::info!(
                    backoff_ms = backoff.as_millis() as u64,
                    next_attempt = job.attempt_count + 1,
                    "Scheduling job retry"
                );
                if shared
                    .jobs
                    .requeue(job.id, job.version, failure, not_before, now)
                    .await?
                    .is_none()
                {
                    tracing::warn!("Job changed while running, retry not scheduled");
                }
            }
            Some(state) => {
                match shared
                    .jobs
                    .finish(job.id, job.version, state, failure, now)
                    .await?
                {
                    Some(finished) => {
                        tracing::warn!(state = %state, "Job finished without success");
                        shared.notify_finished(&finished).await;
                    }
                    None => tracing::warn!("Job changed while running, outcome not recorded"),
                }
            }
        }
        Ok(())
    }

    async fn reaper_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(shared.config.stale_reap_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = Self::reap_stale(&shared, Utc::now()).await {
                        tracing::error!(error = %e, "Stale job reaper failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Return running jobs whose worker stopped heartbeating to the queue, or abandon them
    /// when no attempts are left.
    async fn reap_stale(shared: &Shared, now: DateTime<Utc>) -> Result<usize> {
        let silence = shared.config.job_timeout + shared.config.stale_grace;
        let cutoff = now - chrono::Duration::from_std(silence).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = shared.jobs.stale_running(cutoff, REAP_BATCH).await?;
        let local = shared.running_ids();

        let mut reaped = 0;
        for job in stale.into_iter().filter(|j| !local.contains(&j.id)) {
            let failure = JobFailure {
                kind: JobErrorKind::Timeout,
                message: "Worker stopped heartbeating".to_string(),
            };
            if job.can_retry() {
                if shared
                    .jobs
                    .requeue(job.id, job.version, failure, now, now)
                    .await?
                    .is_some()
                {
                    reaped += 1;
                    tracing::warn!(job.id = %job.id, "Requeued stale job");
                }
            } else if let Some(finished) = shared
                .jobs
                .finish(job.id, job.version, JobState::Abandoned, failure, now)
                .await?
            {
                reaped += 1;
                tracing::warn!(job.id = %job.id, "Abandoned stale job");
                shared.notify_finished(&finished).await;
            }
        }
        Ok(reaped)
    }

    async fn cancel_watch_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(shared.config.cancel_poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let ids = shared.running_ids();
                    if ids.is_empty() {
                        continue;
                    }
                    match shared.jobs.cancel_requested(&ids).await {
                        Ok(requested) => {
                            for id in requested {
                                if shared.signal_cancel(id) {
                                    tracing::info!(job.id = %id, "Cancellation requested, stopping job");
                                }
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to poll cancellations"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Cancel a job. Queued jobs fail at once; a running job is stopped by the worker that
    /// owns it and ends `failed` with reason `cancelled`. Returns `None` for unknown jobs.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<Option<TranscodeJob>> {
        let Some(job) = self.shared.jobs.request_cancel(job_id, Utc::now()).await? else {
            return Ok(None);
        };
        match job.state {
            JobState::Running => {
                if self.shared.signal_cancel(job_id) {
                    tracing::info!("Stopping running job");
                }
            }
            JobState::Failed if job.last_error_kind == Some(JobErrorKind::Cancelled) => {
                tracing::info!("Cancelled queued job");
                self.shared.notify_finished(&job).await;
            }
            _ => {}
        }
        Ok(Some(job))
    }

    /// Number of attempts running in this pool.
    pub fn in_flight(&self) -> usize {
        self.shared
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stop claiming new jobs and wait up to `grace` for in-flight attempts to finish.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("Initiating transcode worker pool shutdown");
        self.shutdown.cancel();
        let workers = self.shared.config.max_workers as u32;
        match tokio::time::timeout(grace, self.shared.semaphore.acquire_many(workers)).await {
            Ok(Ok(_permits)) => tracing::info!("All transcode workers idle"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Worker semaphore closed"),
            Err(_) => tracing::warn!(
                in_flight = self.in_flight(),
                "Shutdown grace elapsed with jobs still running"
            ),
        }
    }
}
