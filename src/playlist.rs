use chrono::SecondsFormat;
use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};
use crate::segment::Segment;

/// HLS protocol version emitted in every playlist.
pub const HLS_VERSION: u8 = 3;

/// Content type for M3U8 playlists.
pub const CONTENT_TYPE_PLAYLIST: &str = "application/vnd.apple.mpegurl";

/// Content type for TS segments.
pub const CONTENT_TYPE_SEGMENT: &str = "video/mp2t";

// ---------------------------------------------------------------------------
// PlaylistType
// ---------------------------------------------------------------------------

/// HLS playlist type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistType {
    /// Live playlist (rolling, no type tag emitted).
    Live,
    /// Event playlist (grows, nothing removed).
    Event,
    /// Complete, static playlist.
    Vod,
}

// ---------------------------------------------------------------------------
// MediaPlaylist
// ---------------------------------------------------------------------------

/// Ordered segment list rendered as an M3U8 media playlist.
///
/// `media_sequence` is the absolute index of the first retained segment and
/// only ever grows; trimming the prefix adds the removed count to it.
/// `target_duration` widens when a longer segment is added but never
/// shrinks.
pub struct MediaPlaylist {
    pub version: u8,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub playlist_type: PlaylistType,
    pub end_list: bool,
    pub dvr_enabled: bool,
    /// DVR window size in seconds (only meaningful when `dvr_enabled`).
    pub dvr_window_secs: f64,
    segments: Vec<Segment>,
}

impl MediaPlaylist {
    pub fn new(target_duration: u64, playlist_type: PlaylistType) -> Self {
        Self {
            version: HLS_VERSION,
            target_duration: target_duration.max(1),
            media_sequence: 0,
            playlist_type,
            end_list: false,
            dvr_enabled: false,
            dvr_window_secs: 0.0,
            segments: Vec::new(),
        }
    }

    pub fn with_dvr(mut self, window_secs: f64) -> Self {
        self.dvr_enabled = true;
        self.dvr_window_secs = window_secs;
        self
    }

    /// Append a segment, widening `target_duration` if needed.
    pub fn add_segment(&mut self, segment: Segment) {
        let rounded = segment.duration.round() as u64;
        if rounded > self.target_duration {
            self.target_duration = rounded;
        }
        self.segments.push(segment);
    }

    /// Drop the oldest `count` segments, advancing `media_sequence` by the
    /// number actually removed.
    pub fn remove_oldest(&mut self, count: usize) {
        let n = count.min(self.segments.len());
        if n > 0 {
            self.segments.drain(..n);
            self.media_sequence += n as u64;
        }
    }

    /// Keep only the newest `count` segments.
    pub fn retain_latest(&mut self, count: usize) {
        if self.segments.len() > count {
            let excess = self.segments.len() - count;
            self.remove_oldest(excess);
        }
    }

    /// Mark the playlist complete.
    pub fn end(&mut self) {
        self.end_list = true;
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Render to M3U8 text.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Reject playlists a compliant player would choke on.
    pub fn validate(&self) -> Result<()> {
        if !(1..=7).contains(&self.version) {
            return Err(Error::invalid_argument(format!(
                "playlist version {} outside [1,7]",
                self.version
            )));
        }
        for segment in &self.segments {
            if segment.duration <= 0.0 {
                return Err(Error::invalid_argument(format!(
                    "segment {} has non-positive duration",
                    segment.index
                )));
            }
            if segment.duration > self.target_duration as f64 + 1.0 {
                return Err(Error::invalid_argument(format!(
                    "segment {} duration {:.3} exceeds target {} + 1",
                    segment.index, segment.duration, self.target_duration
                )));
            }
            if segment.filename.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "segment {} has an empty filename",
                    segment.index
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for MediaPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:{}", self.version)?;
        writeln!(f, "#EXT-X-TARGETDURATION:{}", self.target_duration)?;
        writeln!(f, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence)?;

        match self.playlist_type {
            PlaylistType::Live => {}
            PlaylistType::Event => writeln!(f, "#EXT-X-PLAYLIST-TYPE:EVENT")?,
            PlaylistType::Vod => writeln!(f, "#EXT-X-PLAYLIST-TYPE:VOD")?,
        }

        for segment in &self.segments {
            if segment.discontinuity {
                writeln!(f, "#EXT-X-DISCONTINUITY")?;
            }
            writeln!(
                f,
                "#EXT-X-PROGRAM-DATE-TIME:{}",
                segment
                    .program_date_time
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
            )?;
            writeln!(f, "#EXTINF:{:.3},", segment.duration)?;
            writeln!(f, "{}", segment.filename)?;
        }

        if self.end_list {
            writeln!(f, "#EXT-X-ENDLIST")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Variant / MasterPlaylist
// ---------------------------------------------------------------------------

/// One ABR ladder rung.
#[derive(Debug, Clone, Serialize)]
pub struct Variant {
    pub name: String,
    /// Peak bits per second.
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    /// Relative media playlist URI.
    pub uri: String,
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
}

impl Variant {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// The `#EXT-X-STREAM-INF` attribute line for this variant.
    fn stream_inf(&self) -> String {
        let mut attrs = vec![format!("BANDWIDTH={}", self.bandwidth)];
        if let Some(avg) = self.average_bandwidth {
            attrs.push(format!("AVERAGE-BANDWIDTH={avg}"));
        }
        if let Some(codecs) = &self.codecs {
            attrs.push(format!("CODECS=\"{codecs}\""));
        }
        if self.width > 0 && self.height > 0 {
            attrs.push(format!("RESOLUTION={}", self.resolution()));
        }
        if let Some(fps) = self.frame_rate {
            attrs.push(format!("FRAME-RATE={fps:.3}"));
        }
        format!("#EXT-X-STREAM-INF:{}", attrs.join(","))
    }
}

/// ABR variant registry rendered as the master M3U8.
pub struct MasterPlaylist {
    pub version: u8,
    variants: Vec<Variant>,
}

impl MasterPlaylist {
    pub fn new() -> Self {
        Self {
            version: HLS_VERSION,
            variants: Vec::new(),
        }
    }

    pub fn add_variant(&mut self, variant: Variant) {
        self.variants.push(variant);
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(Error::invalid_argument("master playlist has no variants"));
        }
        for variant in &self.variants {
            if variant.bandwidth == 0 {
                return Err(Error::invalid_argument(format!(
                    "variant '{}' has non-positive bandwidth",
                    variant.name
                )));
            }
            if variant.width == 0 || variant.height == 0 {
                return Err(Error::invalid_argument(format!(
                    "variant '{}' has malformed resolution '{}'",
                    variant.name,
                    variant.resolution()
                )));
            }
        }
        Ok(())
    }
}

impl Default for MasterPlaylist {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MasterPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:{}", self.version)?;

        // Highest quality first.
        let mut variants: Vec<&Variant> = self.variants.iter().collect();
        variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

        for variant in variants {
            writeln!(f, "{}", variant.stream_inf())?;
            writeln!(f, "{}", variant.uri)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentType;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::time::Instant;

    fn seg(index: u64, duration: f64) -> Segment {
        Segment {
            index,
            duration,
            filename: Segment::filename_for(index),
            data: Bytes::from_static(b"ts"),
            program_date_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            segment_type: SegmentType::Muxed,
            discontinuity: false,
            key_frame: true,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn live_playlist_renders_without_type_tag() {
        let mut playlist = MediaPlaylist::new(6, PlaylistType::Live);
        playlist.add_segment(seg(0, 6.0));
        playlist.add_segment(seg(1, 5.96));

        let text = playlist.render();
        assert!(text.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:6\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(!text.contains("#EXT-X-PLAYLIST-TYPE"));
        assert!(text.contains("#EXTINF:6.000,\nsegment_0.ts\n"));
        assert!(text.contains("#EXTINF:5.960,\nsegment_1.ts\n"));
        assert!(text.contains("#EXT-X-PROGRAM-DATE-TIME:2025-06-01T12:00:00.000Z"));
        assert!(!text.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn ended_vod_playlist() {
        let mut playlist = MediaPlaylist::new(6, PlaylistType::Vod);
        playlist.add_segment(seg(0, 4.2));
        playlist.end();

        let text = playlist.render();
        assert!(text.contains("#EXT-X-PLAYLIST-TYPE:VOD\n"));
        assert!(text.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn target_duration_widens_but_never_shrinks() {
        let mut playlist = MediaPlaylist::new(6, PlaylistType::Live);
        playlist.add_segment(seg(0, 8.7));
        assert_eq!(playlist.target_duration, 9);
        playlist.add_segment(seg(1, 2.0));
        assert_eq!(playlist.target_duration, 9);
    }

    #[test]
    fn remove_oldest_advances_media_sequence() {
        let mut playlist = MediaPlaylist::new(6, PlaylistType::Live);
        for i in 0..5 {
            playlist.add_segment(seg(i, 6.0));
        }
        playlist.remove_oldest(2);
        assert_eq!(playlist.media_sequence, 2);
        assert_eq!(playlist.segment_count(), 3);
        assert_eq!(playlist.segments()[0].index, 2);

        playlist.retain_latest(1);
        assert_eq!(playlist.media_sequence, 4);
        assert_eq!(playlist.segment_count(), 1);
    }

    #[test]
    fn extinf_durations_roundtrip_to_three_decimals() {
        let mut playlist = MediaPlaylist::new(6, PlaylistType::Live);
        playlist.add_segment(seg(0, 6.0));
        playlist.add_segment(seg(1, 5.9666));
        playlist.add_segment(seg(2, 0.1));

        let text = playlist.render();
        let parsed: Vec<f64> = text
            .lines()
            .filter_map(|l| l.strip_prefix("#EXTINF:"))
            .map(|l| l.trim_end_matches(',').parse().unwrap())
            .collect();

        for (parsed, original) in parsed.iter().zip(playlist.segments()) {
            assert!((parsed - original.duration).abs() < 0.0005);
        }
    }

    #[test]
    fn dvr_flags_carried() {
        let playlist = MediaPlaylist::new(6, PlaylistType::Live).with_dvr(300.0);
        assert!(playlist.dvr_enabled);
        assert_eq!(playlist.dvr_window_secs, 300.0);

        let plain = MediaPlaylist::new(6, PlaylistType::Live);
        assert!(!plain.dvr_enabled);
    }

    #[test]
    fn discontinuity_tag_rendered_before_segment() {
        let mut playlist = MediaPlaylist::new(6, PlaylistType::Live);
        let mut s = seg(0, 6.0);
        s.discontinuity = true;
        playlist.add_segment(s);

        let text = playlist.render();
        let disc_at = text.find("#EXT-X-DISCONTINUITY").unwrap();
        let extinf_at = text.find("#EXTINF").unwrap();
        assert!(disc_at < extinf_at);
    }

    #[test]
    fn validation_rules() {
        let mut playlist = MediaPlaylist::new(6, PlaylistType::Live);
        playlist.add_segment(seg(0, 6.0));
        assert!(playlist.validate().is_ok());

        playlist.add_segment(seg(1, 7.5)); // widens target to 8
        assert!(playlist.validate().is_ok());

        let mut bad = MediaPlaylist::new(6, PlaylistType::Live);
        bad.add_segment(seg(0, -1.0));
        assert!(bad.validate().is_err());

        let mut bad = MediaPlaylist::new(6, PlaylistType::Live);
        let mut s = seg(0, 6.0);
        s.filename = String::new();
        bad.add_segment(s);
        assert!(bad.validate().is_err());

        let mut bad = MediaPlaylist::new(6, PlaylistType::Live);
        bad.version = 9;
        assert!(bad.validate().is_err());
    }

    fn variant(name: &str, bandwidth: u64) -> Variant {
        Variant {
            name: name.to_string(),
            bandwidth,
            average_bandwidth: Some(bandwidth * 9 / 10),
            codecs: Some("avc1.64001f,mp4a.40.2".to_string()),
            width: 1280,
            height: 720,
            frame_rate: Some(30.0),
            uri: format!("playlist_{name}.m3u8"),
            video_bitrate: bandwidth * 8 / 10,
            audio_bitrate: bandwidth / 10,
        }
    }

    #[test]
    fn master_sorted_descending_by_bandwidth() {
        let mut master = MasterPlaylist::new();
        master.add_variant(variant("low", 800_000));
        master.add_variant(variant("high", 5_000_000));
        master.add_variant(variant("mid", 2_500_000));

        let text = master.render();
        let high = text.find("BANDWIDTH=5000000").unwrap();
        let mid = text.find("BANDWIDTH=2500000").unwrap();
        let low = text.find("BANDWIDTH=800000").unwrap();
        assert!(high < mid && mid < low);
        assert!(text.contains("CODECS=\"avc1.64001f,mp4a.40.2\""));
        assert!(text.contains("RESOLUTION=1280x720"));
        assert!(text.contains("FRAME-RATE=30.000"));
        assert!(text.contains("playlist_high.m3u8"));
    }

    #[test]
    fn master_validation() {
        let empty = MasterPlaylist::new();
        assert!(empty.validate().is_err());

        let mut master = MasterPlaylist::new();
        master.add_variant(variant("ok", 1_000_000));
        assert!(master.validate().is_ok());

        let mut bad = MasterPlaylist::new();
        bad.add_variant(variant("zero", 0));
        assert!(bad.validate().is_err());

        let mut bad = MasterPlaylist::new();
        let mut v = variant("squash", 1_000_000);
        v.height = 0;
        bad.add_variant(v);
        assert!(bad.validate().is_err());
    }
}
