use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;

/// Identifier of a configured storage backend (e.g. `primary`, `r2`).
///
/// Lowercase ASCII letters, digits, `-` and `_` only, so it can appear in env var names and
/// signed URLs unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> anyhow::Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > 32 {
            anyhow::bail!("backend id must be 1-32 characters");
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            anyhow::bail!("Invalid backend id: {}", id);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BackendId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl FromStr for BackendId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_lowercase())
    }
}

impl TryFrom<String> for BackendId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BackendId> for String {
    fn from(id: BackendId) -> Self {
        id.0
    }
}

/// Physical backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    S3,
    Local,
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(BackendKind::S3),
            "local" => Ok(BackendKind::Local),
            "memory" => Ok(BackendKind::Memory),
            _ => Err(anyhow::anyhow!("Invalid storage backend kind: {}", s)),
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            BackendKind::S3 => write!(f, "s3"),
            BackendKind::Local => write!(f, "local"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// What an object is, which is all the cache policy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    MasterPlaylist,
    MediaPlaylist,
    Segment,
    Master,
}

impl ObjectKind {
    /// Classify a storage key by its suffix. Master playlists are always named `master.m3u8`.
    pub fn from_key(key: &str) -> Self {
        let name = key.rsplit('/').next().unwrap_or(key);
        if name == "master.m3u8" {
            ObjectKind::MasterPlaylist
        } else if name.ends_with(".m3u8") {
            ObjectKind::MediaPlaylist
        } else if name.ends_with(".ts") || name.ends_with(".m4s") {
            ObjectKind::Segment
        } else {
            ObjectKind::Master
        }
    }

    pub fn is_manifest(&self) -> bool {
        matches!(self, ObjectKind::MasterPlaylist | ObjectKind::MediaPlaylist)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ObjectKind::MasterPlaylist | ObjectKind::MediaPlaylist => {
                "application/vnd.apple.mpegurl"
            }
            ObjectKind::Segment => "video/mp2t",
            ObjectKind::Master => "application/octet-stream",
        }
    }
}

/// Logical object identity: a key plus the backend that is authoritative for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StorageObject {
    pub key: String,
    pub backend: BackendId,
    pub size: i64,
    pub checksum_sha256: String,
    pub content_type: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for StorageObject {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(StorageObject {
            key: row.try_get("key")?,
            backend: BackendId::new(row.try_get::<String, _>("backend")?).map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse backend id: {}", e).into())
            })?,
            size: row.try_get("size")?,
            checksum_sha256: row.try_get("checksum_sha256")?,
            content_type: row.try_get("content_type")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_id_rejects_unsafe_characters() {
        assert!(BackendId::new("primary").is_ok());
        assert!(BackendId::new("r2_eu-1").is_ok());
        assert!(BackendId::new("").is_err());
        assert!(BackendId::new("a/b").is_err());
        assert!(BackendId::new("Upper").is_err());
        assert_eq!("MinIO".parse::<BackendId>().unwrap().as_str(), "minio");
    }

    #[test]
    fn object_kind_from_key_suffix() {
        assert_eq!(
            ObjectKind::from_key("renditions/v/j/1/master.m3u8"),
            ObjectKind::MasterPlaylist
        );
        assert_eq!(
            ObjectKind::from_key("renditions/v/j/1/720p/index.m3u8"),
            ObjectKind::MediaPlaylist
        );
        assert_eq!(
            ObjectKind::from_key("renditions/v/j/1/720p/segment_00003.ts"),
            ObjectKind::Segment
        );
        assert_eq!(ObjectKind::from_key("masters/r/0/abc"), ObjectKind::Master);
    }
}
