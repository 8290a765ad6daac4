//! Deterministic engine for tests and local development without ffmpeg.
//!
//! Each encode writes `segments_per_rung` small segment files and grows an event playlist the
//! way ffmpeg does, one entry per finished segment. Outcomes of upcoming encode calls can be
//! scripted to fail or hang.

use anyhow::anyhow;
use async_trait::async_trait;
use mise_core::{JobError, JobErrorKind, JobResultExt};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::{EncodeRequest, EncodingEngine, ProbeResult};

const SEGMENT_SECS: f64 = 4.0;

/// What one encode call does.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    Complete,
    /// Write `after_segments` segments, then fail with `kind`.
    Fail {
        kind: JobErrorKind,
        after_segments: usize,
    },
    /// Write `after_segments` segments, then wait until cancelled.
    Hang { after_segments: usize },
}

pub struct ScriptedEngine {
    segments_per_rung: usize,
    segment_bytes: usize,
    segment_delay: Duration,
    corrupt_master: bool,
    outcomes: Mutex<VecDeque<EncodeOutcome>>,
    encode_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(segments_per_rung: usize) -> Self {
        Self {
            segments_per_rung,
            segment_bytes: 2048,
            segment_delay: Duration::ZERO,
            corrupt_master: false,
            outcomes: Mutex::new(VecDeque::new()),
            encode_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
        }
    }

    /// Probing fails the way ffprobe does on a truncated MP4.
    pub fn with_corrupt_master(mut self) -> Self {
        self.corrupt_master = true;
        self
    }

    pub fn with_segment_delay(mut self, delay: Duration) -> Self {
        self.segment_delay = delay;
        self
    }

    pub fn with_segment_bytes(mut self, bytes: usize) -> Self {
        self.segment_bytes = bytes;
        self
    }

    /// Queue the outcome of the next unscripted encode call.
    pub fn push_outcome(&self, outcome: EncodeOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn encode_calls(&self) -> usize {
        self.encode_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> EncodeOutcome {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(EncodeOutcome::Complete)
    }

    fn event_playlist(written: usize, ended: bool) -> String {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:EVENT\n",
            SEGMENT_SECS as u64
        );
        for i in 0..written {
            text.push_str(&format!("#EXTINF:{:.6},\nsegment_{:05}.ts\n", SEGMENT_SECS, i));
        }
        if ended {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        text
    }

    async fn write_segment(
        &self,
        request: &EncodeRequest,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        if !self.segment_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.segment_delay) => {}
                _ = cancel.cancelled() => return Err(JobError::cancelled()),
            }
        }
        if cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }

        let pattern = format!("{}:{:05};", request.rung.label, index);
        let body: Vec<u8> = pattern.bytes().cycle().take(self.segment_bytes).collect();
        let segment = request.output_dir.join(format!("segment_{:05}.ts", index));
        tokio::fs::write(&segment, body).await.transient()?;
        tokio::fs::write(
            request.playlist_path(),
            Self::event_playlist(index + 1, false),
        )
        .await
        .transient()?;
        Ok(())
    }
}

#[async_trait]
impl EncodingEngine for ScriptedEngine {
    async fn probe(&self, input: &Path) -> Result<ProbeResult, JobError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.corrupt_master {
            return Err(JobError::fatal(anyhow!(
                "ffprobe failed: {}: moov atom not found",
                input.display()
            )));
        }
        Ok(ProbeResult {
            duration_secs: SEGMENT_SECS * self.segments_per_rung as f64,
            width: 1920,
            height: 1080,
            codec: "h264".to_string(),
        })
    }

    async fn encode(&self, request: EncodeRequest, cancel: CancellationToken) -> Result<(), JobError> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .transient()?;

        let outcome = self.next_outcome();
        let written = match &outcome {
            EncodeOutcome::Complete => self.segments_per_rung,
            EncodeOutcome::Fail { after_segments, .. }
            | EncodeOutcome::Hang { after_segments } => *after_segments,
        };
        for index in 0..written {
            self.write_segment(&request, index, &cancel).await?;
        }

        match outcome {
            EncodeOutcome::Complete => {
                tokio::fs::write(request.playlist_path(), Self::event_playlist(written, true))
                    .await
                    .transient()?;
                Ok(())
            }
            EncodeOutcome::Fail { kind, .. } => Err(JobError::new(
                kind,
                anyhow!("scripted {} failure on {}", kind, request.rung.label),
            )),
            EncodeOutcome::Hang { .. } => {
                cancel.cancelled().await;
                Err(JobError::cancelled())
            }
        }
    }
}
