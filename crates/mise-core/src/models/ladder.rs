//! Bitrate ladders requested for a transcode job.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;
use validator::Validate;

/// Upper bound on rungs per ladder; each rung is a full encode of the master.
pub const MAX_LADDER_RUNGS: usize = 8;

/// One {resolution, bitrate} entry of a ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, ToSchema)]
pub struct BitrateRung {
    /// Short label used in storage keys and playlists, e.g. `720p`.
    #[validate(length(min = 1, max = 16))]
    pub label: String,
    #[validate(range(min = 64, max = 7680))]
    pub width: u32,
    #[validate(range(min = 64, max = 4320))]
    pub height: u32,
    #[validate(range(min = 100, max = 50000))]
    pub video_bitrate_kbps: u32,
    #[validate(range(min = 32, max = 512))]
    pub audio_bitrate_kbps: u32,
}

impl BitrateRung {
    pub fn new(label: &str, width: u32, height: u32, video_bitrate_kbps: u32) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            video_bitrate_kbps,
            audio_bitrate_kbps: 128,
        }
    }

    /// Peak bandwidth advertised in the master playlist, in bits per second.
    pub fn bandwidth_bps(&self) -> u64 {
        (self.video_bitrate_kbps as u64 + self.audio_bitrate_kbps as u64) * 1000
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Ordered set of rungs, highest bitrate first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct BitrateLadder(Vec<BitrateRung>);

impl BitrateLadder {
    /// Build a ladder, sorting rungs by descending bitrate and rejecting invalid input.
    pub fn new(mut rungs: Vec<BitrateRung>) -> anyhow::Result<Self> {
        if rungs.is_empty() {
            anyhow::bail!("bitrate ladder must contain at least one rung");
        }
        if rungs.len() > MAX_LADDER_RUNGS {
            anyhow::bail!(
                "bitrate ladder has {} rungs, at most {} are allowed",
                rungs.len(),
                MAX_LADDER_RUNGS
            );
        }

        let mut labels = HashSet::new();
        for rung in &rungs {
            rung.validate()
                .map_err(|e| anyhow::anyhow!("invalid rung '{}': {}", rung.label, e))?;
            if !rung
                .label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                anyhow::bail!("rung label '{}' contains invalid characters", rung.label);
            }
            if !labels.insert(rung.label.clone()) {
                anyhow::bail!("duplicate rung label '{}'", rung.label);
            }
        }

        rungs.sort_by(|a, b| b.video_bitrate_kbps.cmp(&a.video_bitrate_kbps));
        Ok(Self(rungs))
    }

    pub fn rungs(&self) -> &[BitrateRung] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for BitrateLadder {
    fn default() -> Self {
        Self(vec![
            BitrateRung::new("1080p", 1920, 1080, 5000),
            BitrateRung::new("720p", 1280, 720, 2800),
            BitrateRung::new("480p", 854, 480, 1400),
            BitrateRung::new("360p", 640, 360, 800),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_sorted_by_descending_bitrate() {
        let ladder = BitrateLadder::new(vec![
            BitrateRung::new("360p", 640, 360, 800),
            BitrateRung::new("1080p", 1920, 1080, 5000),
            BitrateRung::new("720p", 1280, 720, 2800),
        ])
        .unwrap();

        let labels: Vec<_> = ladder.rungs().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["1080p", "720p", "360p"]);
    }

    #[test]
    fn empty_ladder_rejected() {
        assert!(BitrateLadder::new(vec![]).is_err());
    }

    #[test]
    fn duplicate_labels_rejected() {
        let err = BitrateLadder::new(vec![
            BitrateRung::new("720p", 1280, 720, 2800),
            BitrateRung::new("720p", 1280, 720, 2000),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn label_with_path_separator_rejected() {
        assert!(BitrateLadder::new(vec![BitrateRung::new("../x", 640, 360, 800)]).is_err());
    }

    #[test]
    fn out_of_range_bitrate_rejected() {
        assert!(BitrateLadder::new(vec![BitrateRung::new("tiny", 640, 360, 10)]).is_err());
    }

    #[test]
    fn bandwidth_includes_audio() {
        let rung = BitrateRung::new("720p", 1280, 720, 2800);
        assert_eq!(rung.bandwidth_bps(), 2_928_000);
        assert_eq!(rung.resolution(), "1280x720");
    }
}
