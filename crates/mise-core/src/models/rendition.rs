use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// One encoded bitrate/resolution variant. Immutable once stored.
///
/// `rendition_set_id` is the id of the job that produced it; all renditions of one job form
/// the set that is published atomically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Rendition {
    pub id: Uuid,
    pub video_id: Uuid,
    pub rendition_set_id: Uuid,
    pub label: String,
    pub width: i32,
    pub height: i32,
    pub bitrate_kbps: i32,
    pub manifest_key: String,
    pub segment_keys: Vec<String>,
    pub duration_ms: i64,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
}

/// Output of a successful encode, ready to be stored with the job outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionSet {
    pub master_manifest_key: String,
    pub renditions: Vec<Rendition>,
}

impl RenditionSet {
    pub fn total_bytes(&self) -> i64 {
        self.renditions.iter().map(|r| r.byte_size).sum()
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Rendition {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Rendition {
            id: row.try_get("id")?,
            video_id: row.try_get("video_id")?,
            rendition_set_id: row.try_get("rendition_set_id")?,
            label: row.try_get("label")?,
            width: row.try_get("width")?,
            height: row.try_get("height")?,
            bitrate_kbps: row.try_get("bitrate_kbps")?,
            manifest_key: row.try_get("manifest_key")?,
            segment_keys: row.try_get("segment_keys")?,
            duration_ms: row.try_get("duration_ms")?,
            byte_size: row.try_get("byte_size")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
