//! HLS playlist model.
//!
//! Only the subset the pipeline produces is understood: master playlists listing one media
//! playlist per rung, and media playlists of `#EXTINF` + URI pairs. Everything else is carried
//! through untouched when rewriting.

use anyhow::{anyhow, Context, Result};
use mise_core::models::BitrateRung;

/// One media segment as listed in a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub duration_secs: f64,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaPlaylist {
    pub target_duration: u64,
    pub segments: Vec<SegmentEntry>,
    /// `#EXT-X-ENDLIST` seen: the encoder will not append more segments.
    pub ended: bool,
}

impl MediaPlaylist {
    /// Parse a media playlist. A trailing `#EXTINF` without its URI is ignored, which is what
    /// a playlist caught mid-write looks like.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        match lines.next() {
            Some("#EXTM3U") => {}
            _ => return Err(anyhow!("Playlist does not start with #EXTM3U")),
        }

        let mut playlist = MediaPlaylist::default();
        let mut pending: Option<f64> = None;
        for line in lines {
            if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = value
                    .parse()
                    .with_context(|| format!("Invalid target duration: {}", value))?;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value.split(',').next().unwrap_or_default();
                pending = Some(
                    duration
                        .parse()
                        .with_context(|| format!("Invalid segment duration: {}", duration))?,
                );
            } else if line == "#EXT-X-ENDLIST" {
                playlist.ended = true;
            } else if !line.starts_with('#') {
                let duration_secs = pending
                    .take()
                    .ok_or_else(|| anyhow!("Segment URI without #EXTINF: {}", line))?;
                playlist.segments.push(SegmentEntry {
                    duration_secs,
                    uri: line.to_string(),
                });
            }
        }
        Ok(playlist)
    }

    pub fn duration_ms(&self) -> i64 {
        self.segments
            .iter()
            .map(|s| (s.duration_secs * 1000.0).round() as i64)
            .sum()
    }

    /// Render as a finished VOD playlist.
    pub fn render_vod(&self) -> String {
        let target = self
            .segments
            .iter()
            .map(|s| s.duration_secs.ceil() as u64)
            .max()
            .unwrap_or(0)
            .max(self.target_duration);

        let mut out = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n",
            target
        );
        for segment in &self.segments {
            out.push_str(&format!("#EXTINF:{:.6},\n{}\n", segment.duration_secs, segment.uri));
        }
        out.push_str("#EXT-X-ENDLIST\n");
        out
    }
}

/// Master playlist with one variant per rung, highest bandwidth first. Variant URIs are
/// relative: `{label}/index.m3u8`.
pub fn master_playlist(rungs: &[BitrateRung]) -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n\n");
    for rung in rungs {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n{}/index.m3u8\n\n",
            rung.bandwidth_bps(),
            rung.resolution(),
            rung.label
        ));
    }
    playlist
}

/// URI lines of any playlist, in order.
pub fn uris(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Replace every URI line with `f(uri)`, keeping tags and blank lines as they are.
pub fn rewrite_uris(text: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            out.push_str(&f(trimmed));
        }
        out.push('\n');
    }
    out
}

/// Resolve a playlist URI against the storage key of the playlist that lists it.
pub fn resolve_key(playlist_key: &str, uri: &str) -> String {
    match playlist_key.rsplit_once('/') {
        Some((dir, _)) => format!("{}/{}", dir, uri),
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:EVENT\n#EXTINF:6.006000,\nsegment_00000.ts\n#EXTINF:5.500000,\nsegment_00001.ts\n#EXTINF:2.0,\n";

    #[test]
    fn parses_segments_of_growing_playlist() {
        let playlist = MediaPlaylist::parse(EVENT_PLAYLIST).unwrap();
        assert_eq!(playlist.target_duration, 6);
        assert_eq!(playlist.segments.len(), 2);
        assert_eq!(playlist.segments[1].uri, "segment_00001.ts");
        assert!(!playlist.ended);
        assert_eq!(playlist.duration_ms(), 11506);
    }

    #[test]
    fn renders_vod_with_endlist() {
        let playlist = MediaPlaylist::parse(EVENT_PLAYLIST).unwrap();
        let vod = playlist.render_vod();
        assert!(vod.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(vod.trim_end().ends_with("#EXT-X-ENDLIST"));
        let reparsed = MediaPlaylist::parse(&vod).unwrap();
        assert!(reparsed.ended);
        assert_eq!(reparsed.segments, playlist.segments);
    }

    #[test]
    fn rejects_non_playlist() {
        assert!(MediaPlaylist::parse("segment_00000.ts\n").is_err());
    }

    #[test]
    fn master_lists_variants_in_order() {
        let rungs = vec![
            BitrateRung::new("720p", 1280, 720, 2800),
            BitrateRung::new("360p", 640, 360, 800),
        ];
        let master = master_playlist(&rungs);
        assert!(master.starts_with("#EXTM3U\n#EXT-X-VERSION:3"));
        assert!(master.contains("#EXT-X-STREAM-INF:BANDWIDTH=2928000,RESOLUTION=1280x720"));
        assert_eq!(uris(&master), vec!["720p/index.m3u8", "360p/index.m3u8"]);
    }

    #[test]
    fn rewrite_only_touches_uris() {
        let rewritten = rewrite_uris(EVENT_PLAYLIST, |uri| format!("https://cdn/{}?sig=1", uri));
        assert!(rewritten.contains("#EXTINF:6.006000,\nhttps://cdn/segment_00000.ts?sig=1"));
        assert!(rewritten.contains("#EXT-X-TARGETDURATION:6"));
    }

    #[test]
    fn resolves_relative_to_playlist_dir() {
        assert_eq!(
            resolve_key("renditions/v/j/a1/master.m3u8", "720p/index.m3u8"),
            "renditions/v/j/a1/720p/index.m3u8"
        );
        assert_eq!(resolve_key("index.m3u8", "seg.ts"), "seg.ts");
    }
}
