//! ffmpeg/ffprobe engine.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use mise_core::{JobError, JobErrorKind, JobResultExt};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::engine::{EncodeRequest, EncodingEngine, ProbeResult};

/// stderr fragments that mean the input or the invocation can never succeed.
const FATAL_MARKERS: &[&str] = &[
    "Invalid data found when processing input",
    "moov atom not found",
    "could not find codec parameters",
    "Unknown encoder",
    "Unsupported codec",
    "is not supported",
    "does not contain any stream",
    "Output file #0 does not contain any stream",
    "No such file or directory",
    "Invalid argument",
    "Decoding requested, but no decoder found",
];

/// Classify a failed ffmpeg/ffprobe run by its stderr. Anything unrecognised is retried.
pub fn classify_stderr(stderr: &str) -> JobErrorKind {
    if FATAL_MARKERS.iter().any(|m| stderr.contains(m)) {
        JobErrorKind::Fatal
    } else {
        JobErrorKind::Transient
    }
}

/// Last lines of stderr, enough to explain a failure without storing the whole log.
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}

fn validate_binary(path: &str) -> anyhow::Result<()> {
    if path.is_empty()
        || !path
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '\\'))
    {
        return Err(anyhow!("Invalid executable path: {}", path));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegEngine {
    pub fn new(ffmpeg_path: String, ffprobe_path: String) -> anyhow::Result<Self> {
        validate_binary(&ffmpeg_path).context("Invalid FFMPEG_PATH")?;
        validate_binary(&ffprobe_path).context("Invalid FFPROBE_PATH")?;
        Ok(Self {
            ffmpeg_path,
            ffprobe_path,
        })
    }

    fn encode_args(request: &EncodeRequest) -> Vec<String> {
        let rung = &request.rung;
        let segment_pattern = request.output_dir.join("segment_%05d.ts");
        vec![
            "-nostdin".to_string(),
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            request.input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "fast".to_string(),
            "-profile:v".to_string(),
            "main".to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", rung.width, rung.height),
            "-b:v".to_string(),
            format!("{}k", rung.video_bitrate_kbps),
            "-maxrate".to_string(),
            format!("{}k", (rung.video_bitrate_kbps as f32 * 1.2) as u32),
            "-bufsize".to_string(),
            format!("{}k", rung.video_bitrate_kbps * 2),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", rung.audio_bitrate_kbps),
            "-ac".to_string(),
            "2".to_string(),
            "-ar".to_string(),
            "48000".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            request.segment_duration.to_string(),
            // Event playlists are appended as each segment closes, which is what lets the
            // runner upload while the encode continues.
            "-hls_playlist_type".to_string(),
            "event".to_string(),
            "-hls_flags".to_string(),
            "independent_segments+temp_file".to_string(),
            "-hls_segment_filename".to_string(),
            segment_pattern.to_string_lossy().to_string(),
            request.playlist_path().to_string_lossy().to_string(),
        ]
    }
}

#[async_trait]
impl EncodingEngine for FfmpegEngine {
    #[tracing::instrument(skip(self), fields(process.executable.name = "ffprobe"))]
    async fn probe(&self, input: &Path) -> Result<ProbeResult, JobError> {
        let start = std::time::Instant::now();
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "-select_streams",
                "v:0",
            ])
            .arg(input)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute ffprobe")
            .transient()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(JobError::new(
                classify_stderr(&stderr),
                anyhow!("ffprobe failed: {}", stderr_tail(&stderr)),
            ));
        }

        let probe: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("Failed to parse ffprobe output")
            .fatal()?;
        let stream = probe["streams"]
            .get(0)
            .ok_or_else(|| anyhow!("No video stream found"))
            .fatal()?;

        let duration_secs = probe["format"]["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| anyhow!("Could not parse duration"))
            .fatal()?;
        let width = stream["width"]
            .as_u64()
            .ok_or_else(|| anyhow!("Could not parse width"))
            .fatal()? as u32;
        let height = stream["height"]
            .as_u64()
            .ok_or_else(|| anyhow!("Could not parse height"))
            .fatal()? as u32;
        let codec = stream["codec_name"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        tracing::info!(
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            video_duration = duration_secs,
            width,
            height,
            codec = %codec,
            "Video probe completed"
        );

        Ok(ProbeResult {
            duration_secs,
            width,
            height,
            codec,
        })
    }

    #[tracing::instrument(skip(self, request, cancel), fields(
        process.executable.name = "ffmpeg",
        rung = %request.rung.label
    ))]
    async fn encode(&self, request: EncodeRequest, cancel: CancellationToken) -> Result<(), JobError> {
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .context("Failed to create rendition directory")
            .transient()?;

        let start = std::time::Instant::now();
        let mut child = Command::new(&self.ffmpeg_path)
            .args(Self::encode_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to execute ffmpeg")
            .transient()?;

        // Drain stderr concurrently so a chatty encoder never blocks on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for ffmpeg").transient()?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill cancelled ffmpeg process");
                }
                return Err(JobError::cancelled());
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            tracing::warn!(
                exit_code = ?status.code(),
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "ffmpeg exited with failure"
            );
            return Err(JobError::new(
                classify_stderr(&stderr),
                anyhow!("FFmpeg failed: {}", stderr_tail(&stderr)),
            ));
        }

        tracing::debug!(
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Rendition encoded"
        );
        Ok(())
    }
}
