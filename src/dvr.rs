use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::segment::Segment;

// ---------------------------------------------------------------------------
// DvrWindow
// ---------------------------------------------------------------------------

/// Time-bounded rolling archive of recent segments.
///
/// Append-only with time-based trimming: every `add_segment` drops segments
/// older than `window_size` seconds, advancing `start_sequence` for each one
/// removed. Index contiguity holds at all times:
/// `segments[i].index == start_sequence + i`.
pub struct DvrWindow {
    segments: VecDeque<Segment>,
    start_sequence: u64,
    /// Seconds. Zero or negative disables trimming.
    window_size: f64,
    total_duration: f64,
}

impl DvrWindow {
    pub fn new(window_size: f64) -> Self {
        Self {
            segments: VecDeque::new(),
            start_sequence: 0,
            window_size,
            total_duration: 0.0,
        }
    }

    /// Append a segment, then trim everything that fell out of the window.
    ///
    /// Re-appending the current tail index replaces the tail in place (a
    /// retried flush must not create a duplicate). Any other non-contiguous
    /// index is rejected.
    pub fn add_segment(&mut self, segment: Segment) -> Result<()> {
        let next = self.end_sequence().map_or(self.start_sequence, |e| e + 1);

        if let Some(end) = self.end_sequence() {
            if segment.index == end {
                let old = self.segments.back_mut().expect("tail exists");
                self.total_duration += segment.duration - old.duration;
                *old = segment;
                self.trim(Instant::now());
                return Ok(());
            }
        }

        if segment.index != next {
            return Err(Error::invalid_argument(format!(
                "segment index {} breaks window contiguity (expected {next})",
                segment.index
            )));
        }

        self.total_duration += segment.duration;
        self.segments.push_back(segment);
        self.trim(Instant::now());
        Ok(())
    }

    /// Drop segments older than the window, advancing `start_sequence`.
    fn trim(&mut self, now: Instant) {
        if self.window_size <= 0.0 {
            return;
        }
        let horizon = Duration::from_secs_f64(self.window_size);
        while let Some(front) = self.segments.front() {
            // Never trim the only remaining segment out from under a reader.
            if self.segments.len() <= 1 {
                break;
            }
            if now.duration_since(front.created_at) <= horizon {
                break;
            }
            let removed = self.segments.pop_front().expect("front exists");
            self.total_duration -= removed.duration;
            self.start_sequence += 1;
        }
    }

    /// O(1) lookup by absolute segment index.
    pub fn get_segment(&self, index: u64) -> Result<&Segment> {
        if index < self.start_sequence {
            return Err(Error::not_found(format!(
                "segment {index} fell out of the DVR window (starts at {})",
                self.start_sequence
            )));
        }
        let offset = (index - self.start_sequence) as usize;
        self.segments.get(offset).ok_or_else(|| {
            Error::not_found(format!("segment {index} is beyond the DVR window"))
        })
    }

    /// The segment containing `offset` seconds from the window start.
    /// Offsets beyond the window clamp to the last segment (seek-to-live).
    pub fn segment_at_time(&self, offset: f64) -> Option<&Segment> {
        let mut acc = 0.0;
        for segment in &self.segments {
            if offset < acc + segment.duration {
                return Some(segment);
            }
            acc += segment.duration;
        }
        self.segments.back()
    }

    /// Segments whose `[start_time, start_time + duration)` intersects
    /// `[start, end]`, in window order.
    pub fn segments_in_range(&self, start: f64, end: f64) -> Vec<&Segment> {
        let mut result = Vec::new();
        let mut acc = 0.0;
        for segment in &self.segments {
            let seg_start = acc;
            let seg_end = acc + segment.duration;
            if seg_end > start && seg_start <= end {
                result.push(segment);
            }
            acc = seg_end;
        }
        result
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn start_sequence(&self) -> u64 {
        self.start_sequence
    }

    /// Index of the last segment, if any.
    pub fn end_sequence(&self) -> Option<u64> {
        self.segments.back().map(|s| s.index)
    }

    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
