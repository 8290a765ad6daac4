//! Encoding engine abstraction.

use async_trait::async_trait;
use mise_core::models::BitrateRung;
use mise_core::JobError;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Facts about a master needed before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
}

/// Encode one rung of the ladder into an HLS event playlist.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    /// Directory receiving `index.m3u8` and the `segment_NNNNN.ts` files.
    pub output_dir: PathBuf,
    pub rung: BitrateRung,
    pub segment_duration: u64,
}

impl EncodeRequest {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join("index.m3u8")
    }
}

/// External encoder.
///
/// `encode` must list a segment in its playlist only once the segment file is complete, and
/// must return [`JobError::cancelled`] promptly after `cancel` fires, leaving no process
/// running. Errors carry their retry classification.
#[async_trait]
pub trait EncodingEngine: Send + Sync {
    async fn probe(&self, input: &Path) -> Result<ProbeResult, JobError>;

    async fn encode(&self, request: EncodeRequest, cancel: CancellationToken)
        -> Result<(), JobError>;
}
