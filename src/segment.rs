use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::error::Result;
use crate::ts::{
    self, TsWriter, CLOCK_90KHZ, PID_AUDIO, PID_VIDEO, STREAM_ID_AUDIO, STREAM_ID_VIDEO,
};

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// What a segment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Video,
    Audio,
    Muxed,
}

/// One complete MPEG-TS segment.
///
/// Once published into a playlist a segment is shared read-only between the
/// playlist, the DVR window and the HTTP cache; `data` is `Bytes` so those
/// holders share one allocation.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Zero-based, strictly sequential within a stream.
    pub index: u64,
    /// Seconds. Must not exceed target duration + 1 in a compliant playlist.
    pub duration: f64,
    /// `segment_{index}.ts`
    pub filename: String,
    /// Concatenated 188-byte TS packets.
    pub data: Bytes,
    /// Absolute UTC at the first sample.
    pub program_date_time: DateTime<Utc>,
    pub segment_type: SegmentType,
    pub discontinuity: bool,
    pub key_frame: bool,
    pub created_at: Instant,
}

impl Segment {
    pub fn filename_for(index: u64) -> String {
        format!("segment_{index}.ts")
    }
}

// ---------------------------------------------------------------------------
// SegmentFactory
// ---------------------------------------------------------------------------

/// Builds one complete segment per call: PAT, PMT, then the buffered video
/// and audio frames as PES packets.
///
/// PTS/DTS are anchored at `index × duration × 90000` and spread evenly
/// across the frames of the segment; the first video packet carries the PCR
/// for the anchor. The PCR/PTS step between video frames is derived from the
/// configured frame rate.
pub struct SegmentFactory {
    frame_rate: f64,
}

impl SegmentFactory {
    pub fn new(frame_rate: f64) -> Self {
        Self {
            frame_rate: if frame_rate > 0.0 { frame_rate } else { 25.0 },
        }
    }

    /// Packetize `video_frames` + `audio_frames` into a segment.
    ///
    /// Fails when both frame lists are empty (PMT would describe nothing).
    pub fn build(
        &self,
        index: u64,
        duration: f64,
        video_frames: &[Bytes],
        audio_frames: &[Bytes],
        key_frame: bool,
        discontinuity: bool,
        program_date_time: DateTime<Utc>,
    ) -> Result<Segment> {
        let has_video = !video_frames.is_empty();
        let has_audio = !audio_frames.is_empty();

        let mut writer = TsWriter::new();
        let mut out = BytesMut::new();

        writer.write_pat(&mut out);
        writer.write_pmt(&mut out, has_video, has_audio)?;

        let base_pts = (index as f64 * duration * CLOCK_90KHZ as f64) as u64;

        if has_video {
            // 27 MHz PCR advance scaled down to the 90 kHz PTS clock.
            let step = ts::pcr_advance_per_frame(self.frame_rate) / 300;
            for (i, frame) in video_frames.iter().enumerate() {
                let pts = base_pts + i as u64 * step;
                // PCR anchors the first video packet of the segment.
                let pcr = if i == 0 { Some(pts * 300) } else { None };
                writer.write_pes(
                    &mut out,
                    PID_VIDEO,
                    STREAM_ID_VIDEO,
                    frame,
                    pts,
                    Some(pts),
                    pcr,
                );
            }
        }

        if has_audio {
            // Spread audio PTS evenly over the segment span.
            let span = (duration * CLOCK_90KHZ as f64) as u64;
            let step = span / audio_frames.len() as u64;
            for (i, frame) in audio_frames.iter().enumerate() {
                let pts = base_pts + i as u64 * step;
                writer.write_pes(&mut out, PID_AUDIO, STREAM_ID_AUDIO, frame, pts, None, None);
            }
        }

        let segment_type = match (has_video, has_audio) {
            (true, true) => SegmentType::Muxed,
            (true, false) => SegmentType::Video,
            _ => SegmentType::Audio,
        };

        Ok(Segment {
            index,
            duration,
            filename: Segment::filename_for(index),
            data: out.freeze(),
            program_date_time,
            segment_type,
            discontinuity,
            key_frame,
            created_at: Instant::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> SegmentFactory {
        SegmentFactory::new(25.0)
    }

    fn frames(n: usize, len: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(vec![i as u8; len])).collect()
    }

    #[test]
    fn muxed_segment_layout() {
        let seg = factory()
            .build(0, 6.0, &frames(3, 500), &frames(2, 100), true, false, Utc::now())
            .unwrap();

        assert_eq!(seg.index, 0);
        assert_eq!(seg.filename, "segment_0.ts");
        assert_eq!(seg.segment_type, SegmentType::Muxed);
        assert!(seg.key_frame);
        assert_eq!(seg.data.len() % ts::TS_PACKET_SIZE, 0);

        // First two packets are PAT then PMT.
        let pid = |pkt: &[u8]| (((pkt[1] as u16) & 0x1F) << 8) | pkt[2] as u16;
        let pkts: Vec<&[u8]> = seg.data.chunks(ts::TS_PACKET_SIZE).collect();
        assert_eq!(pid(pkts[0]), ts::PID_PAT);
        assert_eq!(pid(pkts[1]), ts::PID_PMT);
        assert_eq!(pid(pkts[2]), PID_VIDEO);
        // Audio packets follow the video packets.
        assert_eq!(pid(pkts[pkts.len() - 1]), PID_AUDIO);
    }

    #[test]
    fn video_only_segment() {
        let seg = factory()
            .build(2, 6.0, &frames(1, 100), &[], false, false, Utc::now())
            .unwrap();
        assert_eq!(seg.segment_type, SegmentType::Video);
        assert_eq!(seg.filename, "segment_2.ts");
    }

    #[test]
    fn empty_segment_rejected() {
        let err = factory()
            .build(0, 6.0, &[], &[], false, false, Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("codec mismatch"));
    }

    #[test]
    fn pts_anchored_at_segment_boundary() {
        // Segment 3 of 6 s: base PTS = 3 * 6 * 90000.
        let seg = factory()
            .build(3, 6.0, &frames(1, 16), &[], true, false, Utc::now())
            .unwrap();

        let pkts: Vec<&[u8]> = seg.data.chunks(ts::TS_PACKET_SIZE).collect();
        let video = pkts[2];
        let adaptation_len = if video[3] & 0x20 != 0 {
            1 + video[4] as usize
        } else {
            0
        };
        let pes = &video[4 + adaptation_len..];
        assert_eq!(&pes[0..3], &[0, 0, 1]);
        let decoded = (((pes[9] as u64 >> 1) & 0x07) << 30)
            | ((pes[10] as u64) << 22)
            | (((pes[11] as u64) >> 1) << 15)
            | ((pes[12] as u64) << 7)
            | ((pes[13] as u64) >> 1);
        assert_eq!(decoded, 3 * 6 * 90_000);
    }

    #[test]
    fn discontinuity_flag_is_carried() {
        let seg = factory()
            .build(0, 4.0, &frames(1, 10), &[], true, true, Utc::now())
            .unwrap();
        assert!(seg.discontinuity);
    }
}
