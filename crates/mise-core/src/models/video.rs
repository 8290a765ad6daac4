use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle of a recipe video as seen by uploaders and players.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    Pending,
    Transcoding,
    Ready,
    Failed,
}

impl Display for VideoState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            VideoState::Pending => write!(f, "pending"),
            VideoState::Transcoding => write!(f, "transcoding"),
            VideoState::Ready => write!(f, "ready"),
            VideoState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for VideoState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VideoState::Pending),
            "transcoding" => Ok(VideoState::Transcoding),
            "ready" => Ok(VideoState::Ready),
            "failed" => Ok(VideoState::Failed),
            _ => Err(anyhow::anyhow!("Invalid video state: {}", s)),
        }
    }
}

/// One physical master asset belonging to a recipe.
///
/// `current_rendition_set` is the id of the job whose renditions are being served; it only
/// changes through an atomic publish.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecipeVideo {
    pub id: Uuid,
    pub recipe_id: Uuid,
    pub ordinal: i32,
    pub state: VideoState,
    pub master_key: String,
    pub current_rendition_set: Option<Uuid>,
    pub manifest_key: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecipeVideo {
    pub fn has_published_renditions(&self) -> bool {
        self.current_rendition_set.is_some()
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for RecipeVideo {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(RecipeVideo {
            id: row.try_get("id")?,
            recipe_id: row.try_get("recipe_id")?,
            ordinal: row.try_get("ordinal")?,
            state: row.try_get::<String, _>("state")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse video state: {}", e).into())
            })?,
            master_key: row.try_get("master_key")?,
            current_rendition_set: row.try_get("current_rendition_set")?,
            manifest_key: row.try_get("manifest_key")?,
            uploaded_at: row.try_get("uploaded_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_state_round_trips_through_text() {
        for state in [
            VideoState::Pending,
            VideoState::Transcoding,
            VideoState::Ready,
            VideoState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<VideoState>().unwrap(), state);
        }
        assert!("archived".parse::<VideoState>().is_err());
    }
}
