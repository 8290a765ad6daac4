use async_trait::async_trait;
use chrono::Utc;
use mise_core::models::{BitrateLadder, JobState, TranscodeJob};
use mise_core::{JobError, JobErrorKind};
use mise_db::{JobStore, MemoryStore, SubmitOutcome, Submission, VideoStore};
use mise_processing::{ProgressSink, TranscodeOutput};
use mise_worker::{JobExecutor, TranscodeWorkerPool, WorkerPoolConfig};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What one scripted attempt does.
#[derive(Clone)]
enum Step {
    Succeed,
    Fail(JobErrorKind),
    /// Run until cancelled.
    Hang,
    Sleep(Duration),
}

#[derive(Default)]
struct FakeExecutor {
    steps: Mutex<VecDeque<Step>>,
    started: Mutex<Vec<Uuid>>,
    finished: Mutex<Vec<TranscodeJob>>,
    executions: Mutex<HashMap<Uuid, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeExecutor {
    fn with_steps(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    fn finished(&self) -> Vec<TranscodeJob> {
        self.finished.lock().unwrap().clone()
    }

    fn executions_of(&self, id: Uuid) -> usize {
        self.executions.lock().unwrap().get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl JobExecutor for FakeExecutor {
    async fn job_started(self: Arc<Self>, job: &TranscodeJob) {
        self.started.lock().unwrap().push(job.id);
    }

    async fn execute(
        self: Arc<Self>,
        job: &TranscodeJob,
        _progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutput, JobError> {
        *self.executions.lock().unwrap().entry(job.id).or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);
        let result = match step {
            Step::Succeed => Ok(()),
            Step::Fail(kind) => Err(JobError::new(kind, anyhow::anyhow!("scripted {}", kind))),
            Step::Hang => {
                cancel.cancelled().await;
                Err(JobError::cancelled())
            }
            Step::Sleep(d) => {
                tokio::select! {
                    _ = tokio::time::sleep(d) => Ok(()),
                    _ = cancel.cancelled() => Err(JobError::cancelled()),
                }
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);

        result.map(|()| TranscodeOutput {
            prefix: format!("renditions/{}/{}/a{}", job.video_id, job.id, job.attempt_count),
            master_playlist_key: format!(
                "renditions/{}/{}/a{}/master.m3u8",
                job.video_id, job.id, job.attempt_count
            ),
            renditions: vec![],
        })
    }

    async fn job_finished(self: Arc<Self>, job: &TranscodeJob) {
        self.finished.lock().unwrap().push(job.clone());
    }
}

fn fast_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        max_workers: 2,
        poll_interval: Duration::from_millis(5),
        job_timeout: Duration::from_secs(30),
        stale_reap_interval: Duration::from_millis(10),
        stale_grace: Duration::from_secs(0),
        cancel_poll_interval: Duration::from_millis(5),
        retry_backoff_unit: Duration::from_millis(1),
    }
}

async fn queue_job(store: &MemoryStore, max_attempts: i32) -> TranscodeJob {
    let outcome = store
        .submit(Submission {
            recipe_id: Uuid::new_v4(),
            ordinal: 0,
            master_key: "masters/r/0/u".to_string(),
            ladder: BitrateLadder::default(),
            max_attempts,
        })
        .await
        .unwrap();
    match outcome {
        SubmitOutcome::Accepted { job, .. } => job,
        SubmitOutcome::Conflict { .. } => panic!("fresh recipe cannot conflict"),
    }
}

fn start(
    store: &Arc<MemoryStore>,
    executor: &Arc<FakeExecutor>,
    config: WorkerPoolConfig,
) -> TranscodeWorkerPool {
    let executor: Arc<dyn JobExecutor> = executor.clone();
    TranscodeWorkerPool::start(store.clone(), config, Arc::downgrade(&executor), None)
}

async fn wait_for_state(store: &MemoryStore, id: Uuid, state: JobState) -> TranscodeJob {
    for _ in 0..400 {
        let job = store.get_job(id).await.unwrap().unwrap();
        if job.state == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {}", id, state);
}

/// A claimed job runs once and ends succeeded
#[tokio::test]
async fn test_job_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![]);
    let job = queue_job(&store, 3).await;
    let _pool = start(&store, &executor, fast_config());

    let done = wait_for_state(&store, job.id, JobState::Succeeded).await;
    assert_eq!(done.attempt_count, 1);
    assert_eq!(executor.started.lock().unwrap().as_slice(), &[job.id]);
    assert_eq!(executor.finished()[0].state, JobState::Succeeded);
}

/// Transient failures are retried with backoff until an attempt succeeds
#[tokio::test]
async fn test_transient_failure_retried() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![
        Step::Fail(JobErrorKind::Transient),
        Step::Fail(JobErrorKind::Timeout),
    ]);
    let job = queue_job(&store, 3).await;
    let _pool = start(&store, &executor, fast_config());

    let done = wait_for_state(&store, job.id, JobState::Succeeded).await;
    assert_eq!(done.attempt_count, 3);
    assert_eq!(done.last_error_kind, Some(JobErrorKind::Timeout));
    assert_eq!(executor.finished().len(), 1, "requeues are not terminal");
}

/// Fatal errors abandon the job without another attempt
#[tokio::test]
async fn test_fatal_error_abandons_immediately() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![Step::Fail(JobErrorKind::Fatal)]);
    let job = queue_job(&store, 3).await;
    let _pool = start(&store, &executor, fast_config());

    let abandoned = wait_for_state(&store, job.id, JobState::Abandoned).await;
    assert_eq!(abandoned.attempt_count, 1);
    assert_eq!(abandoned.last_error_kind, Some(JobErrorKind::Fatal));
    assert_eq!(executor.executions_of(job.id), 1);
}

/// Running out of attempts abandons the job
#[tokio::test]
async fn test_retry_limit_abandons() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![
        Step::Fail(JobErrorKind::Transient),
        Step::Fail(JobErrorKind::Transient),
    ]);
    let job = queue_job(&store, 2).await;
    let _pool = start(&store, &executor, fast_config());

    let abandoned = wait_for_state(&store, job.id, JobState::Abandoned).await;
    assert_eq!(abandoned.attempt_count, 2);
    assert_eq!(abandoned.last_error_kind, Some(JobErrorKind::Transient));
    assert_eq!(executor.finished().len(), 1);
}

/// The wall clock stops a hung encoder and counts as a retryable failure
#[tokio::test]
async fn test_timeout_cancels_attempt() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![Step::Hang]);
    let job = queue_job(&store, 1).await;
    let config = WorkerPoolConfig {
        job_timeout: Duration::from_millis(50),
        stale_reap_interval: Duration::ZERO,
        ..fast_config()
    };
    let _pool = start(&store, &executor, config);

    let abandoned = wait_for_state(&store, job.id, JobState::Abandoned).await;
    assert_eq!(abandoned.last_error_kind, Some(JobErrorKind::Timeout));
}

/// Cancelling a running job stops it and marks it failed, not abandoned
#[tokio::test]
async fn test_cancel_running_job() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![Step::Hang]);
    let job = queue_job(&store, 3).await;
    let pool = start(&store, &executor, fast_config());

    wait_for_state(&store, job.id, JobState::Running).await;
    let flagged = pool.cancel(job.id).await.unwrap().unwrap();
    assert!(flagged.cancel_requested);

    let failed = wait_for_state(&store, job.id, JobState::Failed).await;
    assert_eq!(failed.last_error_kind, Some(JobErrorKind::Cancelled));
    assert_eq!(executor.executions_of(job.id), 1);
}

/// A cancellation requested through the store by another process is picked up by the owner
#[tokio::test]
async fn test_cancel_requested_elsewhere() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![Step::Hang]);
    let job = queue_job(&store, 3).await;
    let _pool = start(&store, &executor, fast_config());

    wait_for_state(&store, job.id, JobState::Running).await;
    store.request_cancel(job.id, Utc::now()).await.unwrap();

    let failed = wait_for_state(&store, job.id, JobState::Failed).await;
    assert_eq!(failed.last_error_kind, Some(JobErrorKind::Cancelled));
}

/// Cancelling a queued job fails it before any worker sees it
#[tokio::test]
async fn test_cancel_queued_job() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![]);
    let job = queue_job(&store, 3).await;
    let config = WorkerPoolConfig {
        poll_interval: Duration::from_secs(3600),
        ..fast_config()
    };
    let pool = start(&store, &executor, config);

    // The first poll happens after `poll_interval`, so the job is still queued here.
    let cancelled = pool.cancel(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(executor.finished().len(), 1);
    assert_eq!(executor.executions_of(job.id), 0);
}

/// Jobs orphaned by a crashed worker are requeued and finished by a live pool
#[tokio::test]
async fn test_stale_job_reaped_and_rerun() {
    let store = Arc::new(MemoryStore::new());
    let job = queue_job(&store, 3).await;
    let claimed = store
        .try_claim(job.id, job.version, Utc::now())
        .await
        .unwrap()
        .unwrap();
    store.set_heartbeat(claimed.id, Some(Utc::now() - chrono::Duration::hours(3)));

    let executor = FakeExecutor::with_steps(vec![]);
    let config = WorkerPoolConfig {
        job_timeout: Duration::from_secs(60),
        ..fast_config()
    };
    let _pool = start(&store, &executor, config);

    let done = wait_for_state(&store, job.id, JobState::Succeeded).await;
    assert_eq!(done.attempt_count, 2);
}

/// No more than `max_workers` attempts run at once
#[tokio::test]
async fn test_concurrency_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![Step::Sleep(Duration::from_millis(40)); 5]);
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(queue_job(&store, 3).await.id);
    }
    let _pool = start(&store, &executor, fast_config());

    for id in ids {
        wait_for_state(&store, id, JobState::Succeeded).await;
    }
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
}

/// Two pools sharing one store never run the same attempt twice
#[tokio::test]
async fn test_competing_pools_claim_each_job_once() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![Step::Sleep(Duration::from_millis(5)); 12]);
    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(queue_job(&store, 3).await.id);
    }
    let config = WorkerPoolConfig {
        poll_interval: Duration::from_millis(1),
        ..fast_config()
    };
    let _a = start(&store, &executor, config.clone());
    let _b = start(&store, &executor, config);

    for id in &ids {
        wait_for_state(&store, *id, JobState::Succeeded).await;
    }
    for id in &ids {
        assert_eq!(executor.executions_of(*id), 1);
    }
}

/// Shutdown stops claiming; queued work stays queued for the next pool
#[tokio::test]
async fn test_shutdown_stops_claiming() {
    let store = Arc::new(MemoryStore::new());
    let executor = FakeExecutor::with_steps(vec![]);
    let pool = start(&store, &executor, fast_config());
    pool.shutdown(Duration::from_secs(1)).await;

    let job = queue_job(&store, 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let still = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(still.state, JobState::Queued);
    assert_eq!(pool.in_flight(), 0);
}
