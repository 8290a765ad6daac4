//! Transcode job error types
//!
//! An encode can fail in ways that deserve different outcomes: a flaky network should be
//! retried, a corrupt master never will succeed, and a cancellation must not be retried at
//! all. [`JobError`] carries that classification alongside the underlying error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Why a job attempt ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Network, 5xx, encoder busy. Retried with backoff.
    Transient,
    /// Corrupt input, unsupported codec, bad configuration. Abandoned immediately.
    Fatal,
    /// Stopped on request. Terminal `failed`.
    Cancelled,
    /// Exceeded the per-attempt wall clock. Retried like a transient error.
    Timeout,
}

impl JobErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobErrorKind::Transient | JobErrorKind::Timeout)
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobErrorKind::Transient => write!(f, "transient"),
            JobErrorKind::Fatal => write!(f, "fatal"),
            JobErrorKind::Cancelled => write!(f, "cancelled"),
            JobErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for JobErrorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(JobErrorKind::Transient),
            "fatal" => Ok(JobErrorKind::Fatal),
            "cancelled" => Ok(JobErrorKind::Cancelled),
            "timeout" => Ok(JobErrorKind::Timeout),
            _ => Err(anyhow::anyhow!("Invalid job error kind: {}", s)),
        }
    }
}

/// Job execution error with its retry classification.
#[derive(Debug)]
pub struct JobError {
    inner: anyhow::Error,
    kind: JobErrorKind,
}

impl JobError {
    pub fn new(kind: JobErrorKind, err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind,
        }
    }

    /// Retried according to the job's attempt limit.
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::new(JobErrorKind::Transient, err)
    }

    /// The job is abandoned without another attempt.
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::new(JobErrorKind::Fatal, err)
    }

    pub fn cancelled() -> Self {
        Self::new(JobErrorKind::Cancelled, anyhow::anyhow!("Cancelled"))
    }

    pub fn timeout(after_secs: u64) -> Self {
        Self::new(
            JobErrorKind::Timeout,
            anyhow::anyhow!("Encode exceeded {}s wall clock", after_secs),
        )
    }

    pub fn kind(&self) -> JobErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for JobError {
    /// Unclassified errors are assumed transient.
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

/// Extension trait to classify a `Result` error in place.
pub trait JobResultExt<T> {
    fn fatal(self) -> Result<T, JobError>;
    fn transient(self) -> Result<T, JobError>;
}

impl<T, E: Into<anyhow::Error>> JobResultExt<T> for Result<T, E> {
    fn fatal(self) -> Result<T, JobError> {
        self.map_err(|e| JobError::fatal(e.into()))
    }

    fn transient(self) -> Result<T, JobError> {
        self.map_err(|e| JobError::transient(e.into()))
    }
}
