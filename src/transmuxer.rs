// Stream-keyed HLS transmux pipeline.
//
// Frames come in per stream key, buffer until the rotation policy fires,
// then flush through the segment factory into every media playlist for the
// stream. Persistence and user callbacks happen off the stream lock.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::HlsConfig;
use crate::dvr::DvrWindow;
use crate::error::{Error, Result};
use crate::playlist::{MasterPlaylist, MediaPlaylist, PlaylistType, Variant};
use crate::segment::{Segment, SegmentFactory};

/// Variant key used when ABR is disabled.
pub const DEFAULT_VARIANT: &str = "default";

/// Minimum emitted segment duration, seconds.
const MIN_SEGMENT_DURATION: f64 = 0.1;

/// Hard-cap multiplier: cut even without a key frame once the buffer grows
/// past `segment_duration * HARD_CAP_FACTOR` (key-frame-sparse input).
const HARD_CAP_FACTOR: f64 = 1.5;

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

pub type SegmentCallback = Arc<dyn Fn(&str, &Segment) + Send + Sync>;
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Stream state
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a stream for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_key: String,
    pub start_time: DateTime<Utc>,
    pub segment_count: u64,
    pub active: bool,
    pub dvr_enabled: bool,
    pub variants: Vec<String>,
}

/// Frame buffer accumulating one segment's worth of input.
struct FrameBuffer {
    video: Vec<Bytes>,
    audio: Vec<Bytes>,
    /// Media timestamp (seconds) of the first buffered frame.
    start_ts: Option<f64>,
    last_video_ts: Option<f64>,
    /// Last observed inter-frame gap; extends the terminal segment span.
    frame_gap: f64,
    starts_with_key: bool,
}

impl FrameBuffer {
    fn new() -> Self {
        Self {
            video: Vec::new(),
            audio: Vec::new(),
            start_ts: None,
            last_video_ts: None,
            frame_gap: 0.0,
            starts_with_key: false,
        }
    }

    fn has_video(&self) -> bool {
        !self.video.is_empty()
    }

    /// Buffer duration if a frame at `ts` were the start of the next segment.
    fn duration_to(&self, ts: f64) -> f64 {
        self.start_ts.map_or(0.0, |s| ts - s)
    }

    /// Current buffered span (first to last video frame).
    fn span(&self) -> f64 {
        match (self.start_ts, self.last_video_ts) {
            (Some(start), Some(last)) => last - start,
            _ => 0.0,
        }
    }

    fn take(&mut self) -> (Vec<Bytes>, Vec<Bytes>, Option<f64>, bool) {
        let video = std::mem::take(&mut self.video);
        let audio = std::mem::take(&mut self.audio);
        let start = self.start_ts.take();
        let key = self.starts_with_key;
        self.last_video_ts = None;
        self.starts_with_key = false;
        (video, audio, start, key)
    }
}

struct StreamState {
    stream_key: String,
    start_time: DateTime<Utc>,
    master: Option<MasterPlaylist>,
    playlists: HashMap<String, MediaPlaylist>,
    dvr: Option<DvrWindow>,
    buffer: FrameBuffer,
    next_index: u64,
    segment_count: u64,
}

impl StreamState {
    fn info(&self, active: bool) -> StreamInfo {
        StreamInfo {
            stream_key: self.stream_key.clone(),
            start_time: self.start_time,
            segment_count: self.segment_count,
            active,
            dvr_enabled: self.dvr.is_some(),
            variants: self.playlists.keys().cloned().collect(),
        }
    }
}

/// A flushed segment plus everything that must happen off the stream lock:
/// disk writes and the completion callback.
struct Emission {
    stream_key: String,
    segment: Segment,
    playlists: Vec<(String, String)>,
    master: Option<String>,
}

// ---------------------------------------------------------------------------
// Transmuxer
// ---------------------------------------------------------------------------

/// Owns every per-stream pipeline: buffers, rotation, playlists, DVR and
/// persistence. All mutation happens under the stream-map write lock;
/// persistence and callbacks run after the lock is released.
pub struct Transmuxer {
    config: HlsConfig,
    factory: SegmentFactory,
    variants: Vec<Variant>,
    streams: RwLock<HashMap<String, StreamState>>,
    on_segment_complete: RwLock<Option<SegmentCallback>>,
    on_stream_start: RwLock<Option<StreamCallback>>,
    on_stream_end: RwLock<Option<StreamCallback>>,
}

impl Transmuxer {
    pub fn new(config: HlsConfig) -> Self {
        let factory = SegmentFactory::new(config.frame_rate);
        Self {
            config,
            factory,
            variants: Vec::new(),
            streams: RwLock::new(HashMap::new()),
            on_segment_complete: RwLock::new(None),
            on_stream_start: RwLock::new(None),
            on_stream_end: RwLock::new(None),
        }
    }

    /// Configure the ABR ladder (used when `abr_enabled`).
    pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
        self.variants = variants;
        self
    }

    // ── Callback registration ───────────────────────────────────────────

    pub fn set_on_segment_complete(&self, cb: SegmentCallback) {
        *self.on_segment_complete.write().unwrap() = Some(cb);
    }

    pub fn set_on_stream_start(&self, cb: StreamCallback) {
        *self.on_stream_start.write().unwrap() = Some(cb);
    }

    pub fn set_on_stream_end(&self, cb: StreamCallback) {
        *self.on_stream_end.write().unwrap() = Some(cb);
    }

    // ── Stream lifecycle ────────────────────────────────────────────────

    /// Create the per-stream state and playlists.
    pub fn start_stream(&self, stream_key: &str) -> Result<()> {
        if stream_key.is_empty() {
            return Err(Error::invalid_argument("stream key must not be empty"));
        }

        {
            let mut streams = self.streams.write().unwrap();
            if streams.contains_key(stream_key) {
                return Err(Error::already_exists(format!("stream '{stream_key}'")));
            }

            let target = self.config.segment_duration.ceil() as u64;
            let mut playlists = HashMap::new();
            let mut master = None;

            if self.config.abr_enabled && !self.variants.is_empty() {
                let mut mp = MasterPlaylist::new();
                for variant in &self.variants {
                    mp.add_variant(variant.clone());
                    playlists.insert(
                        variant.name.clone(),
                        self.new_media_playlist(target),
                    );
                }
                master = Some(mp);
            } else {
                playlists.insert(DEFAULT_VARIANT.to_string(), self.new_media_playlist(target));
            }

            let dvr = self
                .config
                .dvr_enabled
                .then(|| DvrWindow::new(self.config.dvr_window_secs));

            streams.insert(
                stream_key.to_string(),
                StreamState {
                    stream_key: stream_key.to_string(),
                    start_time: Utc::now(),
                    master,
                    playlists,
                    dvr,
                    buffer: FrameBuffer::new(),
                    next_index: 0,
                    segment_count: 0,
                },
            );
        }

        info!("stream '{stream_key}' started");
        if let Some(cb) = self.on_stream_start.read().unwrap().clone() {
            let key = stream_key.to_string();
            spawn_callback(move || cb(&key));
        }
        Ok(())
    }

    fn new_media_playlist(&self, target: u64) -> MediaPlaylist {
        let playlist = MediaPlaylist::new(target, PlaylistType::Live);
        if self.config.dvr_enabled {
            playlist.with_dvr(self.config.dvr_window_secs)
        } else {
            playlist
        }
    }

    /// Flush remaining buffered video as a terminal segment, mark every
    /// playlist ended, persist, and drop the runtime state.
    pub fn stop_stream(&self, stream_key: &str) -> Result<()> {
        let (state, emission) = {
            let mut streams = self.streams.write().unwrap();
            let mut state = streams
                .remove(stream_key)
                .ok_or_else(|| Error::not_found(format!("stream '{stream_key}'")))?;

            let emission = if state.buffer.has_video() {
                let duration = state.buffer.span() + state.buffer.frame_gap;
                match self.flush_locked(&mut state, duration) {
                    Ok(e) => Some(e),
                    Err(err) => {
                        warn!("stream '{stream_key}': terminal flush failed: {err}");
                        None
                    }
                }
            } else {
                None
            };

            for playlist in state.playlists.values_mut() {
                playlist.end();
            }
            (state, emission)
        };

        if let Some(emission) = emission {
            self.commit(emission);
        }

        // Persist the ended playlists so players see EXT-X-ENDLIST.
        let rendered: Vec<(String, String)> = state
            .playlists
            .iter()
            .map(|(name, p)| (name.clone(), p.render()))
            .collect();
        let master = state.master.as_ref().map(|m| m.render());
        self.persist_playlists(stream_key, &rendered, master.as_deref());

        info!(
            "stream '{stream_key}' stopped ({} segment(s))",
            state.segment_count
        );
        if let Some(cb) = self.on_stream_end.read().unwrap().clone() {
            let key = stream_key.to_string();
            spawn_callback(move || cb(&key));
        }
        Ok(())
    }

    // ── Frame ingestion ─────────────────────────────────────────────────

    /// Append a video frame. `timestamp` is seconds on the stream's media
    /// timeline; `is_key_frame` marks IDR frames.
    ///
    /// Rotation happens *before* the triggering key frame is appended, so
    /// each new segment starts on a key frame; a hard cap cuts regardless
    /// once the buffer outgrows 1.5× the target duration.
    pub fn write_video_frame(
        &self,
        stream_key: &str,
        data: Bytes,
        timestamp: f64,
        is_key_frame: bool,
    ) -> Result<()> {
        let emission = {
            let mut streams = self.streams.write().unwrap();
            let state = streams
                .get_mut(stream_key)
                .ok_or_else(|| Error::not_found(format!("stream '{stream_key}'")))?;

            let mut emission = None;

            if is_key_frame
                && state.buffer.has_video()
                && state.buffer.duration_to(timestamp) >= self.config.segment_duration
            {
                let duration = state.buffer.duration_to(timestamp);
                match self.flush_locked(state, duration) {
                    Ok(e) => emission = Some(e),
                    // Buffer is preserved inside flush_locked on failure.
                    Err(err) => warn!("stream '{stream_key}': segment flush failed: {err}"),
                }
            }

            if state.buffer.start_ts.is_none() {
                state.buffer.start_ts = Some(timestamp);
                state.buffer.starts_with_key = is_key_frame;
            }
            if let Some(last) = state.buffer.last_video_ts {
                let gap = timestamp - last;
                if gap > 0.0 {
                    state.buffer.frame_gap = gap;
                }
            }
            state.buffer.video.push(data);
            state.buffer.last_video_ts = Some(timestamp);

            if emission.is_none() && state.buffer.span() >= self.config.segment_duration * HARD_CAP_FACTOR
            {
                let duration = state.buffer.span() + state.buffer.frame_gap;
                match self.flush_locked(state, duration) {
                    Ok(e) => emission = Some(e),
                    Err(err) => warn!("stream '{stream_key}': hard-cap flush failed: {err}"),
                }
            }

            emission
        };

        if let Some(emission) = emission {
            self.commit(emission);
        }
        Ok(())
    }

    /// Append an audio frame to the current buffer.
    pub fn write_audio_frame(&self, stream_key: &str, data: Bytes, timestamp: f64) -> Result<()> {
        let mut streams = self.streams.write().unwrap();
        let state = streams
            .get_mut(stream_key)
            .ok_or_else(|| Error::not_found(format!("stream '{stream_key}'")))?;

        if state.buffer.start_ts.is_none() {
            state.buffer.start_ts = Some(timestamp);
        }
        state.buffer.audio.push(data);
        Ok(())
    }

    // ── Segment emission ────────────────────────────────────────────────

    /// Build a segment from the buffer and append it to every playlist.
    /// Runs under the stream lock; returns the work to finish outside it.
    /// On factory failure the buffer is left intact for the next attempt.
    fn flush_locked(&self, state: &mut StreamState, duration: f64) -> Result<Emission> {
        let duration = duration.max(MIN_SEGMENT_DURATION);
        let index = state.next_index;

        let start_offset = state.buffer.start_ts.unwrap_or(0.0);
        let program_date_time = state.start_time
            + chrono::Duration::milliseconds((start_offset * 1000.0) as i64);

        let segment = self.factory.build(
            index,
            duration,
            &state.buffer.video,
            &state.buffer.audio,
            state.buffer.starts_with_key,
            false,
            program_date_time,
        )?;

        // Factory succeeded: the buffer's contents are now owned by the
        // segment, so clear it for the next one.
        let _ = state.buffer.take();
        state.next_index += 1;
        state.segment_count += 1;

        if let Some(dvr) = state.dvr.as_mut() {
            if let Err(err) = dvr.add_segment(segment.clone()) {
                warn!(
                    "stream '{}': DVR append failed for segment {index}: {err}",
                    state.stream_key
                );
            }
        }

        for playlist in state.playlists.values_mut() {
            playlist.add_segment(segment.clone());
            match state.dvr.as_ref() {
                Some(dvr) => {
                    // The DVR window already decided the retained prefix.
                    let drop = dvr.start_sequence().saturating_sub(playlist.media_sequence);
                    playlist.remove_oldest(drop as usize);
                }
                None => playlist.retain_latest(self.config.playlist_size),
            }
        }

        let playlists = state
            .playlists
            .iter()
            .map(|(name, p)| (name.clone(), p.render()))
            .collect();
        let master = state.master.as_ref().map(|m| m.render());

        Ok(Emission {
            stream_key: state.stream_key.clone(),
            segment,
            playlists,
            master,
        })
    }

    /// Persist the segment and playlists, then fire the completion callback
    /// on its own task. All I/O is best-effort.
    fn commit(&self, emission: Emission) {
        let Emission {
            stream_key,
            segment,
            playlists,
            master,
        } = emission;

        if !self.config.output_dir.is_empty() {
            let dir = self.stream_dir(&stream_key);
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!("stream '{stream_key}': cannot create '{}': {err}", dir.display());
            } else if let Err(err) = std::fs::write(dir.join(&segment.filename), &segment.data) {
                warn!(
                    "stream '{stream_key}': writing '{}' failed: {err}",
                    segment.filename
                );
            }
        }
        self.persist_playlists(&stream_key, &playlists, master.as_deref());

        if let Some(cb) = self.on_segment_complete.read().unwrap().clone() {
            spawn_callback(move || cb(&stream_key, &segment));
        }
    }

    fn persist_playlists(
        &self,
        stream_key: &str,
        playlists: &[(String, String)],
        master: Option<&str>,
    ) {
        if self.config.output_dir.is_empty() {
            return;
        }
        let dir = self.stream_dir(stream_key);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!("stream '{stream_key}': cannot create '{}': {err}", dir.display());
            return;
        }

        for (name, content) in playlists {
            let filename = playlist_filename(name);
            if let Err(err) = std::fs::write(dir.join(&filename), content) {
                warn!("stream '{stream_key}': writing '{filename}' failed: {err}");
            }
        }
        if let Some(master) = master {
            if let Err(err) = std::fs::write(dir.join("master.m3u8"), master) {
                warn!("stream '{stream_key}': writing 'master.m3u8' failed: {err}");
            }
        }
    }

    fn stream_dir(&self, stream_key: &str) -> PathBuf {
        Path::new(&self.config.output_dir).join(stream_key)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Render the media playlist for `variant` (`None` → "default").
    pub fn playlist(&self, stream_key: &str, variant: Option<&str>) -> Result<String> {
        let streams = self.streams.read().unwrap();
        let state = streams
            .get(stream_key)
            .ok_or_else(|| Error::not_found(format!("stream '{stream_key}'")))?;
        let name = variant.unwrap_or(DEFAULT_VARIANT);
        state
            .playlists
            .get(name)
            .map(|p| p.render())
            .ok_or_else(|| Error::not_found(format!("variant '{name}' of stream '{stream_key}'")))
    }

    /// Render the master playlist, if ABR is active for this stream.
    pub fn master_playlist(&self, stream_key: &str) -> Result<String> {
        let streams = self.streams.read().unwrap();
        let state = streams
            .get(stream_key)
            .ok_or_else(|| Error::not_found(format!("stream '{stream_key}'")))?;
        state
            .master
            .as_ref()
            .map(|m| m.render())
            .ok_or_else(|| Error::not_found(format!("stream '{stream_key}' has no master playlist")))
    }

    pub fn stream_info(&self, stream_key: &str) -> Result<StreamInfo> {
        let streams = self.streams.read().unwrap();
        streams
            .get(stream_key)
            .map(|s| s.info(true))
            .ok_or_else(|| Error::not_found(format!("stream '{stream_key}'")))
    }

    /// Keys of every active stream.
    pub fn stream_keys(&self) -> Vec<String> {
        let streams = self.streams.read().unwrap();
        streams.keys().cloned().collect()
    }

    pub fn is_active(&self, stream_key: &str) -> bool {
        self.streams.read().unwrap().contains_key(stream_key)
    }

    pub fn segment_count(&self, stream_key: &str) -> u64 {
        self.streams
            .read()
            .unwrap()
            .get(stream_key)
            .map_or(0, |s| s.segment_count)
    }

    /// Fetch a segment still held in the stream's DVR window (serves cache
    /// misses for segments that were never persisted or already evicted
    /// from disk-backed storage).
    pub fn dvr_segment(&self, stream_key: &str, index: u64) -> Result<Segment> {
        let streams = self.streams.read().unwrap();
        let state = streams
            .get(stream_key)
            .ok_or_else(|| Error::not_found(format!("stream '{stream_key}'")))?;
        let dvr = state
            .dvr
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("stream '{stream_key}' has no DVR window")))?;
        dvr.get_segment(index).cloned()
    }
}

/// Standard ABR ladder used when variants are enabled but not otherwise
/// configured.
pub fn default_variants() -> Vec<Variant> {
    let rungs = [
        ("720p", 1280u32, 720u32, 2_500_000u64, 128_000u64, "avc1.4d401f"),
        ("480p", 854, 480, 1_200_000, 128_000, "avc1.4d401e"),
        ("360p", 640, 360, 700_000, 96_000, "avc1.42e01e"),
    ];
    rungs
        .iter()
        .map(|(name, width, height, video, audio, codec)| Variant {
            name: (*name).to_string(),
            bandwidth: video + audio,
            average_bandwidth: Some((video + audio) * 9 / 10),
            codecs: Some(format!("{codec},mp4a.40.2")),
            width: *width,
            height: *height,
            frame_rate: None,
            uri: format!("playlist_{name}.m3u8"),
            video_bitrate: *video,
            audio_bitrate: *audio,
        })
        .collect()
}

/// Run a user callback on its own task so it can never block the pipeline.
/// Outside a runtime (plain unit tests) the callback runs inline.
fn spawn_callback<F: FnOnce() + Send + 'static>(f: F) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => f(),
    }
}

fn playlist_filename(variant: &str) -> String {
    if variant == DEFAULT_VARIANT {
        "playlist.m3u8".to_string()
    } else {
        format!("playlist_{variant}.m3u8")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    fn config(output_dir: &str) -> HlsConfig {
        HlsConfig {
            segment_duration: 6.0,
            playlist_size: 6,
            dvr_enabled: false,
            dvr_window_secs: 0.0,
            output_dir: output_dir.to_string(),
            frame_rate: 25.0,
            abr_enabled: false,
        }
    }

    fn frame() -> Bytes {
        Bytes::from(vec![0x42u8; 256])
    }

    /// Scenario: 30 one-second frames, key frame every 6th, interleaved
    /// audio. Expect five ~6 s segments, a sequence-0 playlist with five
    /// EXTINF entries, and persisted files.
    #[test]
    fn happy_path_thirty_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Transmuxer::new(config(dir.path().to_str().unwrap()));
        mux.start_stream("s").unwrap();

        for i in 0..30u64 {
            let ts = i as f64;
            mux.write_video_frame("s", frame(), ts, i % 6 == 0).unwrap();
            mux.write_audio_frame("s", Bytes::from(vec![0u8; 64]), ts).unwrap();
        }

        // Four rotations have happened; the fifth segment flushes on stop.
        assert_eq!(mux.segment_count("s"), 4);
        let playlist = mux.playlist("s", None).unwrap();
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));

        mux.stop_stream("s").unwrap();
        assert!(mux.stop_stream("s").is_err());

        let stream_dir = dir.path().join("s");
        let playlist = std::fs::read_to_string(stream_dir.join("playlist.m3u8")).unwrap();
        assert_eq!(playlist.matches("#EXTINF:").count(), 5);
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(playlist.contains("#EXT-X-ENDLIST"));

        let durations: Vec<f64> = playlist
            .lines()
            .filter_map(|l| l.strip_prefix("#EXTINF:"))
            .map(|l| l.trim_end_matches(',').parse().unwrap())
            .collect();
        assert_eq!(durations.len(), 5);
        for d in durations {
            assert!((5.9..=6.1).contains(&d), "duration {d} out of range");
        }

        for i in 0..5u64 {
            assert!(
                stream_dir.join(format!("segment_{i}.ts")).exists(),
                "segment_{i}.ts missing"
            );
        }
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let mux = Transmuxer::new(config(""));
        mux.start_stream("s").unwrap();
        let err = mux.start_stream("s").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn frame_write_to_unknown_stream() {
        let mux = Transmuxer::new(config(""));
        let err = mux.write_video_frame("nope", frame(), 0.0, true).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = mux.write_audio_frame("nope", frame(), 0.0).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn new_segment_starts_on_key_frame() {
        let mux = Transmuxer::new(config(""));
        mux.start_stream("s").unwrap();

        // Key frames at 0 and 7 s; rotation triggers at the 7 s key frame
        // and the first segment spans exactly [0, 7).
        for i in 0..7u64 {
            mux.write_video_frame("s", frame(), i as f64, i == 0).unwrap();
        }
        assert_eq!(mux.segment_count("s"), 0);
        mux.write_video_frame("s", frame(), 7.0, true).unwrap();
        assert_eq!(mux.segment_count("s"), 1);

        let playlist = mux.playlist("s", None).unwrap();
        assert!(playlist.contains("#EXTINF:7.000,"));
    }

    #[test]
    fn hard_cap_cuts_without_key_frame() {
        let mux = Transmuxer::new(config(""));
        mux.start_stream("s").unwrap();

        // Single key frame at 0, then deltas only. 1.5 × 6 s = 9 s cap.
        for i in 0..12u64 {
            mux.write_video_frame("s", frame(), i as f64, i == 0).unwrap();
        }
        assert_eq!(mux.segment_count("s"), 1);
    }

    #[test]
    fn segment_callback_fires_with_snapshot() {
        let mux = Transmuxer::new(config(""));
        let (tx, rx) = mpsc::channel();
        mux.set_on_segment_complete(Arc::new(move |key, segment| {
            tx.send((key.to_string(), segment.index, segment.duration)).unwrap();
        }));

        mux.start_stream("s").unwrap();
        for i in 0..7u64 {
            mux.write_video_frame("s", frame(), i as f64, i % 6 == 0).unwrap();
        }

        let (key, index, duration) = rx.recv_timeout(StdDuration::from_secs(1)).unwrap();
        assert_eq!(key, "s");
        assert_eq!(index, 0);
        assert!((duration - 6.0).abs() < 1e-9);
    }

    #[test]
    fn stream_lifecycle_callbacks() {
        let mux = Transmuxer::new(config(""));
        let (tx, rx) = mpsc::channel();
        let tx_end = tx.clone();
        mux.set_on_stream_start(Arc::new(move |key| {
            tx.send(format!("start:{key}")).unwrap();
        }));
        mux.set_on_stream_end(Arc::new(move |key| {
            tx_end.send(format!("end:{key}")).unwrap();
        }));

        mux.start_stream("s").unwrap();
        mux.stop_stream("s").unwrap();

        assert_eq!(rx.recv_timeout(StdDuration::from_secs(1)).unwrap(), "start:s");
        assert_eq!(rx.recv_timeout(StdDuration::from_secs(1)).unwrap(), "end:s");
    }

    #[test]
    fn playlist_size_retention_advances_sequence() {
        let mut cfg = config("");
        cfg.playlist_size = 2;
        let mux = Transmuxer::new(cfg);
        mux.start_stream("s").unwrap();

        // Four rotations: key frame every 6 s over 25 frames.
        for i in 0..25u64 {
            mux.write_video_frame("s", frame(), i as f64, i % 6 == 0).unwrap();
        }
        assert_eq!(mux.segment_count("s"), 4);

        let playlist = mux.playlist("s", None).unwrap();
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2"));
        assert_eq!(playlist.matches("#EXTINF:").count(), 2);
        assert!(playlist.contains("segment_2.ts"));
        assert!(playlist.contains("segment_3.ts"));
    }

    #[test]
    fn abr_creates_variant_playlists_and_master() {
        let mut cfg = config("");
        cfg.abr_enabled = true;
        let variants = vec![
            Variant {
                name: "720p".into(),
                bandwidth: 2_800_000,
                average_bandwidth: None,
                codecs: Some("avc1.4d401f,mp4a.40.2".into()),
                width: 1280,
                height: 720,
                frame_rate: Some(25.0),
                uri: "playlist_720p.m3u8".into(),
                video_bitrate: 2_500_000,
                audio_bitrate: 128_000,
            },
            Variant {
                name: "360p".into(),
                bandwidth: 800_000,
                average_bandwidth: None,
                codecs: Some("avc1.42e01e,mp4a.40.2".into()),
                width: 640,
                height: 360,
                frame_rate: Some(25.0),
                uri: "playlist_360p.m3u8".into(),
                video_bitrate: 700_000,
                audio_bitrate: 96_000,
            },
        ];
        let mux = Transmuxer::new(cfg).with_variants(variants);
        mux.start_stream("s").unwrap();

        let master = mux.master_playlist("s").unwrap();
        let hi = master.find("BANDWIDTH=2800000").unwrap();
        let lo = master.find("BANDWIDTH=800000").unwrap();
        assert!(hi < lo);

        for i in 0..7u64 {
            mux.write_video_frame("s", frame(), i as f64, i % 6 == 0).unwrap();
        }
        assert!(mux.playlist("s", Some("720p")).unwrap().contains("segment_0.ts"));
        assert!(mux.playlist("s", Some("360p")).unwrap().contains("segment_0.ts"));
        assert!(mux.playlist("s", None).is_err());
    }

    #[test]
    fn dvr_segment_lookup_without_persistence() {
        let mut cfg = config("");
        cfg.dvr_enabled = true;
        cfg.dvr_window_secs = 600.0;
        let mux = Transmuxer::new(cfg);
        mux.start_stream("s").unwrap();

        for i in 0..7u64 {
            mux.write_video_frame("s", frame(), i as f64, i % 6 == 0).unwrap();
        }

        let segment = mux.dvr_segment("s", 0).unwrap();
        assert_eq!(segment.index, 0);
        assert!(!segment.data.is_empty());
        assert!(mux.dvr_segment("s", 5).is_err());

        // DVR lookups only exist for DVR-enabled streams.
        let plain = Transmuxer::new(config(""));
        plain.start_stream("p").unwrap();
        assert!(plain.dvr_segment("p", 0).is_err());
    }

    #[test]
    fn stream_info_reflects_state() {
        let mux = Transmuxer::new(config(""));
        mux.start_stream("s").unwrap();
        assert!(mux.is_active("s"));

        for i in 0..13u64 {
            mux.write_video_frame("s", frame(), i as f64, i % 6 == 0).unwrap();
        }
        let info = mux.stream_info("s").unwrap();
        assert_eq!(info.stream_key, "s");
        assert_eq!(info.segment_count, 2);
        assert_eq!(info.segment_count, mux.segment_count("s"));
        assert!(!info.dvr_enabled);
        assert_eq!(info.variants, vec![DEFAULT_VARIANT.to_string()]);

        mux.stop_stream("s").unwrap();
        assert!(!mux.is_active("s"));
        assert!(mux.stream_info("s").is_err());
    }

    #[test]
    fn dvr_retention_tracks_window() {
        let mut cfg = config("");
        cfg.dvr_enabled = true;
        cfg.dvr_window_secs = 600.0;
        let mux = Transmuxer::new(cfg);
        mux.start_stream("s").unwrap();

        for i in 0..13u64 {
            mux.write_video_frame("s", frame(), i as f64, i % 6 == 0).unwrap();
        }
        // Fresh segments stay inside a 10-minute window.
        assert_eq!(mux.segment_count("s"), 2);
        let playlist = mux.playlist("s", None).unwrap();
        assert_eq!(playlist.matches("#EXTINF:").count(), 2);
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
    }
}
