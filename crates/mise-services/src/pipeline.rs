//! Glue between the worker pool and the rest of the pipeline: encodes claimed jobs with the
//! transcode runner and reports their outcomes to the ingest coordinator.

use async_trait::async_trait;
use mise_core::models::TranscodeJob;
use mise_core::JobError;
use mise_processing::{ProgressSink, TranscodeOutput, TranscodeRunner};
use mise_worker::JobExecutor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ingest::IngestCoordinator;

pub struct TranscodePipeline {
    runner: TranscodeRunner,
    ingest: Arc<IngestCoordinator>,
}

impl TranscodePipeline {
    pub fn new(runner: TranscodeRunner, ingest: Arc<IngestCoordinator>) -> Self {
        Self { runner, ingest }
    }
}

#[async_trait]
impl JobExecutor for TranscodePipeline {
    async fn job_started(self: Arc<Self>, job: &TranscodeJob) {
        if let Err(e) = self.ingest.on_job_started(job).await {
            tracing::warn!(error = %e, job.id = %job.id, "Failed to record job start");
        }
    }

    async fn execute(
        self: Arc<Self>,
        job: &TranscodeJob,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutput, JobError> {
        self.runner.run(job, progress, cancel).await
    }

    async fn job_finished(self: Arc<Self>, job: &TranscodeJob) {
        // A lost publish is picked up by `IngestCoordinator::reconcile`.
        if let Err(e) = self.ingest.on_job_completed(job).await {
            tracing::error!(error = %e, job.id = %job.id, "Failed to record job outcome");
        }
    }
}
