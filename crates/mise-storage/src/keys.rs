//! Shared key layout for all backends.
//!
//! Masters: `masters/{recipe_id}/{ordinal}/{upload_id}`.
//! Renditions: `renditions/{video_id}/{job_id}/a{attempt}/...` with `master.m3u8` at the
//! root of that prefix and `{label}/index.m3u8` plus `{label}/segment_NNNNN.ts` below it.
//! Each attempt writes under its own prefix so a retried attempt never overwrites objects a
//! previous attempt may have left behind.

use crate::traits::{StorageError, StorageResult};

pub const MAX_KEY_LEN: usize = 1024;

pub fn master_key(recipe_id: impl std::fmt::Display, ordinal: i32, upload_id: impl std::fmt::Display) -> String {
    format!("masters/{}/{}/{}", recipe_id, ordinal, upload_id)
}

pub fn rendition_prefix(
    video_id: impl std::fmt::Display,
    job_id: impl std::fmt::Display,
    attempt: i32,
) -> String {
    format!("renditions/{}/{}/a{}", video_id, job_id, attempt)
}

pub fn master_playlist_key(prefix: &str) -> String {
    format!("{}/master.m3u8", prefix)
}

pub fn media_playlist_key(prefix: &str, label: &str) -> String {
    format!("{}/{}/index.m3u8", prefix, label)
}

pub fn segment_key(prefix: &str, label: &str, file_name: &str) -> String {
    format!("{}/{}/{}", prefix, label, file_name)
}

/// Reject keys that could escape a backend root or be ambiguous across providers.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "key length must be 1-{} bytes",
            MAX_KEY_LEN
        )));
    }
    if key.starts_with('/')
        || key.ends_with('/')
        || key.contains("//")
        || key.contains('\\')
        || key.split('/').any(|part| part == ".." || part == ".")
        || key.chars().any(|c| c.is_control())
    {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}
