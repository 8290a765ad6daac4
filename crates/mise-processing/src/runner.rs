//! One attempt of a transcode job: master → ladder of HLS renditions in object storage.
//!
//! Segments are uploaded while the encoder is still running, as soon as they appear in its
//! event playlist, so local scratch never holds more than a few segments per rung. A failed
//! attempt deletes everything it uploaded; nothing under the attempt prefix is referenced
//! until the job is published.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use mise_core::models::{BitrateRung, JobProgress, ObjectKind, Rendition, TranscodeJob};
use mise_core::{JobError, JobResultExt};
use mise_storage::{keys, ObjectStoreAdapter, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

use crate::engine::{EncodeRequest, EncodingEngine};
use crate::playlist::{self, MediaPlaylist};

/// Receives progress as the attempt advances. Implementations must not fail the job.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: JobProgress);
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub scratch_dir: PathBuf,
    pub segment_duration: u64,
    /// How often the encoder's playlist is checked for finished segments.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            segment_duration: 6,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Everything a successful attempt produced.
#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub prefix: String,
    pub master_playlist_key: String,
    pub renditions: Vec<Rendition>,
}

/// Map storage failures onto job retry semantics.
pub fn storage_job_error(err: StorageError) -> JobError {
    match err {
        StorageError::Transient(_)
        | StorageError::Io(_)
        | StorageError::Catalog(_)
        | StorageError::IntegrityMismatch { .. } => JobError::transient(err),
        _ => JobError::fatal(err),
    }
}

/// Segments of one rung uploaded so far.
#[derive(Default)]
struct RungUploads {
    keys: Vec<String>,
    bytes: i64,
}

pub struct TranscodeRunner {
    engine: Arc<dyn EncodingEngine>,
    storage: Arc<ObjectStoreAdapter>,
    config: RunnerConfig,
}

impl TranscodeRunner {
    pub fn new(
        engine: Arc<dyn EncodingEngine>,
        storage: Arc<ObjectStoreAdapter>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            engine,
            storage,
            config,
        }
    }

    /// Storage prefix owned by the job's current attempt.
    pub fn output_prefix(job: &TranscodeJob) -> String {
        keys::rendition_prefix(job.video_id, job.id, job.attempt_count)
    }

    #[tracing::instrument(skip_all, fields(
        job.id = %job.id,
        video.id = %job.video_id,
        attempt = job.attempt_count
    ))]
    pub async fn run(
        &self,
        job: &TranscodeJob,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutput, JobError> {
        let start = std::time::Instant::now();
        let prefix = Self::output_prefix(job);

        match self.run_attempt(job, &prefix, progress, &cancel).await {
            Ok(output) => {
                tracing::info!(
                    renditions = output.renditions.len(),
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Transcode attempt succeeded"
                );
                Ok(output)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    error_kind = %e.kind(),
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Transcode attempt failed, discarding partial output"
                );
                self.discard(&prefix).await;
                Err(e)
            }
        }
    }

    async fn run_attempt(
        &self,
        job: &TranscodeJob,
        prefix: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TranscodeOutput, JobError> {
        tokio::fs::create_dir_all(&self.config.scratch_dir)
            .await
            .context("Failed to create scratch directory")
            .transient()?;
        let scratch = tempfile::Builder::new()
            .prefix("mise-transcode-")
            .tempdir_in(&self.config.scratch_dir)
            .context("Failed to create temp directory")
            .transient()?;

        let input = scratch.path().join("master");
        self.download_master(&job.source_key, &input, cancel).await?;

        let probe = self.engine.probe(&input).await?;
        tracing::info!(
            source_width = probe.width,
            source_height = probe.height,
            source_duration = probe.duration_secs,
            codec = %probe.codec,
            "Master probed"
        );

        let mut tracker = JobProgress {
            renditions_total: job.ladder.len() as i32,
            ..JobProgress::default()
        };
        let mut renditions = Vec::with_capacity(job.ladder.len());
        for rung in job.ladder.rungs() {
            if cancel.is_cancelled() {
                return Err(JobError::cancelled());
            }
            let rendition = self
                .encode_rung(job, prefix, &input, scratch.path(), rung, &mut tracker, progress, cancel)
                .await?;
            tracker.renditions_done += 1;
            progress.report(tracker).await;
            renditions.push(rendition);
        }

        let master_playlist_key = keys::master_playlist_key(prefix);
        self.storage
            .put(
                &master_playlist_key,
                Bytes::from(playlist::master_playlist(job.ladder.rungs())),
                ObjectKind::MasterPlaylist.content_type(),
            )
            .await
            .map_err(storage_job_error)?;

        Ok(TranscodeOutput {
            prefix: prefix.to_string(),
            master_playlist_key,
            renditions,
        })
    }

    async fn download_master(
        &self,
        key: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let mut stream = self.storage.get_stream(key).await.map_err(|e| match e {
            StorageError::NotFound(_) => JobError::fatal(anyhow!("Master {} is missing", key)),
            e => storage_job_error(e),
        })?;
        let mut file = tokio::fs::File::create(path)
            .await
            .context("Failed to create master scratch file")
            .transient()?;

        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(JobError::cancelled());
            }
            let chunk = chunk.map_err(storage_job_error)?;
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .context("Failed to write master to scratch")
                .transient()?;
        }
        file.flush().await.transient()?;
        tracing::debug!(key = %key, size_bytes = size, "Master downloaded");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all, fields(rung = %rung.label))]
    async fn encode_rung(
        &self,
        job: &TranscodeJob,
        prefix: &str,
        input: &Path,
        scratch: &Path,
        rung: &BitrateRung,
        tracker: &mut JobProgress,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Rendition, JobError> {
        let request = EncodeRequest {
            input: input.to_path_buf(),
            output_dir: scratch.join(&rung.label),
            rung: rung.clone(),
            segment_duration: self.config.segment_duration,
        };
        let playlist_path = request.playlist_path();
        let output_dir = request.output_dir.clone();

        let token = cancel.child_token();
        let engine = self.engine.clone();
        let encode_token = token.clone();
        let mut encode = AbortOnDropHandle::new(tokio::spawn(async move {
            engine.encode(request, encode_token).await
        }));

        let mut uploads = RungUploads::default();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let joined = loop {
            tokio::select! {
                joined = &mut encode => break joined,
                _ = ticker.tick() => {
                    let uploaded = self
                        .upload_finished(&playlist_path, &output_dir, prefix, rung, &mut uploads, tracker, progress, false)
                        .await;
                    if let Err(e) = uploaded {
                        token.cancel();
                        return Err(e);
                    }
                }
            }
        };
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(JobError::transient(anyhow!("Encoder task failed: {}", e))),
        }

        let playlist = self
            .upload_finished(&playlist_path, &output_dir, prefix, rung, &mut uploads, tracker, progress, true)
            .await?
            .ok_or_else(|| anyhow!("Encoder produced no playlist for {}", rung.label))
            .fatal()?;
        if playlist.segments.is_empty() {
            return Err(JobError::fatal(anyhow!(
                "Encoder produced no segments for {}",
                rung.label
            )));
        }

        let manifest_key = keys::media_playlist_key(prefix, &rung.label);
        self.storage
            .put(
                &manifest_key,
                Bytes::from(playlist.render_vod()),
                ObjectKind::MediaPlaylist.content_type(),
            )
            .await
            .map_err(storage_job_error)?;

        Ok(Rendition {
            id: Uuid::new_v4(),
            video_id: job.video_id,
            rendition_set_id: job.id,
            label: rung.label.clone(),
            width: rung.width as i32,
            height: rung.height as i32,
            bitrate_kbps: rung.video_bitrate_kbps as i32,
            manifest_key,
            segment_keys: uploads.keys,
            duration_ms: playlist.duration_ms(),
            byte_size: uploads.bytes,
            created_at: Utc::now(),
        })
    }

    /// Upload segments the encoder has finished since the last call. While the encoder runs
    /// a missing or half-written playlist just means nothing is ready yet; once it has
    /// exited (`final_pass`) the playlist must parse.
    #[allow(clippy::too_many_arguments)]
    async fn upload_finished(
        &self,
        playlist_path: &Path,
        output_dir: &Path,
        prefix: &str,
        rung: &BitrateRung,
        uploads: &mut RungUploads,
        tracker: &mut JobProgress,
        progress: &dyn ProgressSink,
        final_pass: bool,
    ) -> Result<Option<MediaPlaylist>, JobError> {
        let text = match tokio::fs::read_to_string(playlist_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(JobError::transient(e)),
        };
        let playlist = match MediaPlaylist::parse(&text) {
            Ok(playlist) => playlist,
            Err(e) if final_pass => return Err(JobError::fatal(e)),
            Err(e) => {
                tracing::debug!(error = %e, "Playlist not readable yet");
                return Ok(None);
            }
        };

        for entry in playlist.segments.iter().skip(uploads.keys.len()) {
            if entry.uri.contains('/') || entry.uri.contains("..") {
                return Err(JobError::fatal(anyhow!(
                    "Unexpected segment URI in encoder playlist: {}",
                    entry.uri
                )));
            }
            let local = output_dir.join(&entry.uri);
            let key = keys::segment_key(prefix, &rung.label, &entry.uri);
            let file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("Failed to open segment {}", local.display()))
                .transient()?;
            let object = self
                .storage
                .put_stream(&key, Box::pin(file), ObjectKind::Segment.content_type())
                .await
                .map_err(storage_job_error)?;
            if let Err(e) = tokio::fs::remove_file(&local).await {
                tracing::warn!(error = %e, path = %local.display(), "Failed to remove uploaded segment");
            }

            tracing::debug!(key = %key, size_bytes = object.size, "Segment uploaded");
            uploads.keys.push(key);
            uploads.bytes += object.size;
            tracker.segments_uploaded += 1;
            tracker.bytes_uploaded += object.size;
            progress.report(*tracker).await;
        }

        Ok(Some(playlist))
    }

    async fn discard(&self, prefix: &str) {
        // Trailing slash so attempt a1 never matches a10.
        match self.storage.delete_prefix(&format!("{}/", prefix)).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(prefix = %prefix, removed, "Discarded partial attempt output")
            }
            Err(e) => tracing::warn!(
                error = %e,
                prefix = %prefix,
                "Failed to discard partial attempt output"
            ),
        }
    }
}
