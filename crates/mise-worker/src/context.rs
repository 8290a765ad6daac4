//! Job executor trait
//!
//! The service layer implements this trait for whatever turns a claimed job into renditions
//! and reacts to its outcome. The pool holds a weak reference and calls into it for every
//! job it claims.

use async_trait::async_trait;
use mise_core::models::TranscodeJob;
use mise_core::JobError;
use mise_processing::{ProgressSink, TranscodeOutput};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Called after a successful claim, before [`execute`](Self::execute).
    async fn job_started(self: Arc<Self>, job: &TranscodeJob);

    /// Run one attempt. Must stop and return [`JobError::cancelled`] soon after `cancel`
    /// fires, having discarded its partial output.
    async fn execute(
        self: Arc<Self>,
        job: &TranscodeJob,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutput, JobError>;

    /// The job reached `succeeded`, `failed` or `abandoned`. Not called for requeued
    /// attempts.
    async fn job_finished(self: Arc<Self>, job: &TranscodeJob);
}
