//! Mise Processing Library
//!
//! Turns a stored master into HLS renditions: the [`EncodingEngine`] seam with its ffmpeg
//! and scripted implementations, the playlist model, and [`TranscodeRunner`], which runs one
//! attempt of a job end to end.

pub mod engine;
pub mod ffmpeg;
pub mod playlist;
pub mod runner;
pub mod scripted;

pub use engine::{EncodeRequest, EncodingEngine, ProbeResult};
pub use ffmpeg::FfmpegEngine;
pub use playlist::MediaPlaylist;
pub use runner::{storage_job_error, ProgressSink, RunnerConfig, TranscodeOutput, TranscodeRunner};
pub use scripted::{EncodeOutcome, ScriptedEngine};
