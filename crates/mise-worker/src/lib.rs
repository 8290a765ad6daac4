//! Mise Worker Library
//!
//! The transcode worker pool. Jobs are claimed from a [`mise_db::JobStore`] and handed to a
//! [`JobExecutor`] supplied by the service layer.

pub mod context;
pub mod queue;

pub use context::JobExecutor;
pub use queue::{TranscodeWorkerPool, WorkerPoolConfig, JOB_NOTIFY_CHANNEL, MAX_RETRY_BACKOFF_SECS};
