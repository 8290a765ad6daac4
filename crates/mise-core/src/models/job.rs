use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use super::ladder::BitrateLadder;
use crate::job_error::JobErrorKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Abandoned,
}

impl JobState {
    /// Queued and running jobs count against the one-active-job-per-video limit.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "abandoned" => Ok(JobState::Abandoned),
            _ => Err(anyhow::anyhow!("Invalid job state: {}", s)),
        }
    }
}

/// Incremental progress reported by the worker while a job runs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct JobProgress {
    pub renditions_total: i32,
    pub renditions_done: i32,
    pub segments_uploaded: i64,
    pub bytes_uploaded: i64,
}

/// One unit of work converting a video master into a rendition set.
///
/// `version` increments on every state transition and is the compare-and-swap token for
/// claims and outcome updates.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TranscodeJob {
    pub id: Uuid,
    pub video_id: Uuid,
    pub source_key: String,
    pub ladder: BitrateLadder,
    pub state: JobState,
    pub version: i64,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error_kind: Option<JobErrorKind>,
    pub last_error_message: Option<String>,
    pub progress: JobProgress,
    pub cancel_requested: bool,
    pub not_before: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TranscodeJob {
    /// Build a freshly queued job. Persistence layers assign nothing else.
    pub fn queued(
        video_id: Uuid,
        source_key: String,
        ladder: BitrateLadder,
        max_attempts: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            video_id,
            source_key,
            progress: JobProgress {
                renditions_total: ladder.len() as i32,
                ..JobProgress::default()
            },
            ladder,
            state: JobState::Queued,
            version: 0,
            attempt_count: 0,
            max_attempts,
            last_error_kind: None,
            last_error_message: None,
            cancel_requested: false,
            not_before: now,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.not_before <= now
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for TranscodeJob {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let ladder: sqlx::types::Json<BitrateLadder> = row.try_get("ladder")?;
        let last_error_kind = row
            .try_get::<Option<String>, _>("last_error_kind")?
            .map(|s| s.parse::<JobErrorKind>())
            .transpose()
            .map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse last_error_kind: {}", e).into())
            })?;
        Ok(TranscodeJob {
            id: row.try_get("id")?,
            video_id: row.try_get("video_id")?,
            source_key: row.try_get("source_key")?,
            ladder: ladder.0,
            state: row.try_get::<String, _>("state")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse job state: {}", e).into())
            })?,
            version: row.try_get("version")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error_kind,
            last_error_message: row.try_get("last_error_message")?,
            progress: JobProgress {
                renditions_total: row.try_get("renditions_total")?,
                renditions_done: row.try_get("renditions_done")?,
                segments_uploaded: row.try_get("segments_uploaded")?,
                bytes_uploaded: row.try_get("bytes_uploaded")?,
            },
            cancel_requested: row.try_get("cancel_requested")?,
            not_before: row.try_get("not_before")?,
            started_at: row.try_get("started_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            finished_at: row.try_get("finished_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
