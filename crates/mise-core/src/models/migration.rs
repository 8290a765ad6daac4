use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use super::storage_object::BackendId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Running,
    Completed,
    CompletedWithFailures,
}

impl Display for MigrationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            MigrationState::Running => write!(f, "running"),
            MigrationState::Completed => write!(f, "completed"),
            MigrationState::CompletedWithFailures => write!(f, "completed_with_failures"),
        }
    }
}

impl FromStr for MigrationState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(MigrationState::Running),
            "completed" => Ok(MigrationState::Completed),
            "completed_with_failures" => Ok(MigrationState::CompletedWithFailures),
            _ => Err(anyhow::anyhow!("Invalid migration state: {}", s)),
        }
    }
}

/// Persisted progress of one backend-to-backend migration; its id is the resumable handle.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MigrationRecord {
    pub id: Uuid,
    pub source: BackendId,
    pub dest: BackendId,
    pub prefix: String,
    pub state: MigrationState,
    /// Last key processed in this pass; scanning resumes strictly after it.
    pub cursor: Option<String>,
    pub copied: i64,
    pub skipped: i64,
    pub failed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters added to a record after each processed page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationTally {
    pub copied: i64,
    pub skipped: i64,
    pub failed: i64,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for MigrationRecord {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let backend = |column: &str| -> Result<BackendId, sqlx::Error> {
            BackendId::new(row.try_get::<String, _>(column)?).map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse {}: {}", column, e).into())
            })
        };
        Ok(MigrationRecord {
            id: row.try_get("id")?,
            source: backend("source_backend")?,
            dest: backend("dest_backend")?,
            prefix: row.try_get("prefix")?,
            state: row.try_get::<String, _>("state")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse migration state: {}", e).into())
            })?,
            cursor: row.try_get("cursor")?,
            copied: row.try_get("copied")?,
            skipped: row.try_get("skipped")?,
            failed: row.try_get("failed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
