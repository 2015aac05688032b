// HLS HTTP surface.
//
// Playlists are rendered live and served no-cache; segments are immutable
// and served with a long cache lifetime through a process-wide TTL cache
// backed by the persisted files on disk.

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::playlist::{CONTENT_TYPE_PLAYLIST, CONTENT_TYPE_SEGMENT};
use crate::transmuxer::Transmuxer;

/// Default cache lifetime for immutable segments.
pub const SEGMENT_CACHE_TTL: Duration = Duration::from_secs(86_400);

/// How often the sweeper evicts expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// SegmentCache
// ---------------------------------------------------------------------------

struct CacheEntry {
    data: Bytes,
    mime: &'static str,
    expires_at: Instant,
}

/// Process-wide segment cache keyed `{stream_key}/{filename}`.
///
/// Lookups only return unexpired entries; the sweeper deletes the rest once
/// a minute. Hit/miss counters double as the verification hook for cache
/// behavior.
pub struct SegmentCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SegmentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<(Bytes, &'static str)> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.data.clone(), entry.mime))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, data: Bytes, mime: &'static str) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            key,
            CacheEntry {
                data,
                mime,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Evict expired cache entries once a minute until cancelled.
pub fn spawn_cache_sweeper(
    cache: Arc<SegmentCache>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("segment cache sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    let swept = cache.sweep();
                    if swept > 0 {
                        debug!("segment cache: swept {swept} expired entr(ies)");
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// HlsState
// ---------------------------------------------------------------------------

pub struct HlsState {
    pub transmuxer: Arc<Transmuxer>,
    pub cache: Arc<SegmentCache>,
    pub output_dir: String,
    /// Configured CORS origins (`*` allows everything).
    pub allowed_origins: Vec<String>,
}

impl HlsState {
    /// CORS decision per request: returns the `Access-Control-Allow-Origin`
    /// value to echo, or `None` when the origin is not allowed.
    fn cors_origin(&self, request_origin: Option<&str>) -> Option<String> {
        let allow_any = self.allowed_origins.iter().any(|o| o == "*");
        match request_origin {
            Some(origin) => {
                if allow_any || self.allowed_origins.iter().any(|o| o == origin) {
                    Some(origin.to_string())
                } else {
                    None
                }
            }
            None if allow_any => Some("*".to_string()),
            None => None,
        }
    }
}

fn apply_cors(state: &HlsState, headers: &HeaderMap, response: &mut Response) {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if let Some(allow) = state.cors_origin(origin) {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&allow) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Range"),
        );
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET / — HTML index of active stream keys.
pub async fn index(State(state): State<Arc<crate::AppState>>) -> Html<String> {
    let state = &state.hls;
    let mut keys = state.transmuxer.stream_keys();
    keys.sort();

    let mut body = String::from(
        "<!DOCTYPE html><html><head><title>StreamCast HLS</title></head><body>\
         <h1>Active streams</h1><ul>",
    );
    for key in &keys {
        body.push_str(&format!(
            "<li><a href=\"/{key}/playlist.m3u8\">{key}</a></li>"
        ));
    }
    if keys.is_empty() {
        body.push_str("<li>(none)</li>");
    }
    body.push_str("</ul></body></html>");
    Html(body)
}

/// GET /{stream_key}/{file} — playlists and segments.
pub async fn serve_file(
    State(state): State<Arc<crate::AppState>>,
    AxumPath((stream_key, file)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let state = &state.hls;
    if stream_key.is_empty() || stream_key.contains("..") || stream_key.contains('/') {
        return Err(ApiError::bad_request("invalid stream key"));
    }

    let mut response = match classify(&file) {
        // Live playlists render from memory; ended streams fall back to the
        // files persisted at stop time.
        HlsFile::Master => {
            let text = match state.transmuxer.master_playlist(&stream_key) {
                Ok(text) => text,
                Err(_) => read_from_disk_text(state, &stream_key, "master.m3u8")
                    .map_err(|_| ApiError::stream_not_found(&stream_key))?,
            };
            playlist_response(text)
        }
        HlsFile::Media(variant) => {
            let text = match state.transmuxer.playlist(&stream_key, variant.as_deref()) {
                Ok(text) => text,
                Err(_) => read_from_disk_text(state, &stream_key, &file)
                    .map_err(|_| ApiError::stream_not_found(&stream_key))?,
            };
            playlist_response(text)
        }
        HlsFile::Segment(index) => {
            let data = match lookup_segment(state, &stream_key, &file) {
                Ok((data, _)) => data,
                // Not on disk: the DVR window may still hold it in memory.
                Err(_) => {
                    let segment = state
                        .transmuxer
                        .dvr_segment(&stream_key, index)
                        .map_err(|_| {
                            ApiError::not_found(format!("segment '{file}' not found"))
                        })?;
                    state.cache.insert(
                        format!("{stream_key}/{file}"),
                        segment.data.clone(),
                        CONTENT_TYPE_SEGMENT,
                    );
                    segment.data
                }
            };
            segment_response(data)
        }
        HlsFile::Unknown => return Err(ApiError::bad_request(format!("unknown file '{file}'"))),
    };

    apply_cors(state, &headers, &mut response);
    Ok(response)
}

/// OPTIONS — CORS preflight. 200 with the configured headers when the
/// origin is allowed; no CORS headers otherwise.
pub async fn preflight(State(state): State<Arc<crate::AppState>>, headers: HeaderMap) -> Response {
    let mut response = StatusCode::OK.into_response();
    apply_cors(&state.hls, &headers, &mut response);
    response
}

enum HlsFile {
    Master,
    Media(Option<String>),
    Segment(u64),
    Unknown,
}

fn classify(file: &str) -> HlsFile {
    if file == "master.m3u8" {
        return HlsFile::Master;
    }
    if file == "playlist.m3u8" {
        return HlsFile::Media(None);
    }
    if let Some(variant) = file
        .strip_prefix("playlist_")
        .and_then(|rest| rest.strip_suffix(".m3u8"))
    {
        if !variant.is_empty() {
            return HlsFile::Media(Some(variant.to_string()));
        }
    }
    if let Some(index) = file
        .strip_prefix("segment_")
        .and_then(|rest| rest.strip_suffix(".ts"))
    {
        if let Ok(index) = index.parse::<u64>() {
            return HlsFile::Segment(index);
        }
    }
    HlsFile::Unknown
}

/// Cache-through segment lookup. Returns the bytes and whether they came
/// from the cache.
fn lookup_segment(
    state: &HlsState,
    stream_key: &str,
    filename: &str,
) -> std::io::Result<(Bytes, bool)> {
    let cache_key = format!("{stream_key}/{filename}");
    if let Some((data, _)) = state.cache.get(&cache_key) {
        return Ok((data, true));
    }

    let path = Path::new(&state.output_dir).join(stream_key).join(filename);
    let data = Bytes::from(std::fs::read(&path)?);
    state
        .cache
        .insert(cache_key, data.clone(), CONTENT_TYPE_SEGMENT);
    Ok((data, false))
}

fn read_from_disk_text(
    state: &HlsState,
    stream_key: &str,
    filename: &str,
) -> std::io::Result<String> {
    let path = Path::new(&state.output_dir).join(stream_key).join(filename);
    std::fs::read_to_string(&path).map_err(|err| {
        warn!("reading '{}' failed: {err}", path.display());
        err
    })
}

fn playlist_response(text: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE_PLAYLIST),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        text,
    )
        .into_response()
}

fn segment_response(data: Bytes) -> Response {
    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE_SEGMENT),
            (header::CACHE_CONTROL, "public, max-age=86400"),
        ],
        data,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HlsConfig;

    fn state_with(dir: &str, ttl: Duration, origins: &[&str]) -> HlsState {
        let cfg = HlsConfig {
            output_dir: dir.to_string(),
            ..HlsConfig::default()
        };
        HlsState {
            transmuxer: Arc::new(Transmuxer::new(cfg)),
            cache: Arc::new(SegmentCache::new(ttl)),
            output_dir: dir.to_string(),
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn cache_serves_second_request_identically() {
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("s");
        std::fs::create_dir_all(&stream_dir).unwrap();
        std::fs::write(stream_dir.join("segment_0.ts"), b"tsdata").unwrap();

        let state = state_with(dir.path().to_str().unwrap(), SEGMENT_CACHE_TTL, &["*"]);

        let (first, cached) = lookup_segment(&state, "s", "segment_0.ts").unwrap();
        assert!(!cached);
        let (second, cached) = lookup_segment(&state, "s", "segment_0.ts").unwrap();
        assert!(cached);
        assert_eq!(first, second);
        assert_eq!(state.cache.hit_count(), 1);
        assert_eq!(state.cache.miss_count(), 1);
    }

    #[test]
    fn expired_entry_swept_and_reread_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("s");
        std::fs::create_dir_all(&stream_dir).unwrap();
        std::fs::write(stream_dir.join("segment_0.ts"), b"tsdata").unwrap();

        // Zero TTL simulates the 24 h expiry elapsing.
        let state = state_with(dir.path().to_str().unwrap(), Duration::ZERO, &["*"]);

        let (_, cached) = lookup_segment(&state, "s", "segment_0.ts").unwrap();
        assert!(!cached);
        assert_eq!(state.cache.sweep(), 1);
        assert!(state.cache.is_empty());

        let (third, cached) = lookup_segment(&state, "s", "segment_0.ts").unwrap();
        assert!(!cached, "expired entry must be re-read from disk");
        assert_eq!(&third[..], b"tsdata");
    }

    #[test]
    fn missing_segment_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path().to_str().unwrap(), SEGMENT_CACHE_TTL, &["*"]);
        assert!(lookup_segment(&state, "s", "segment_0.ts").is_err());
    }

    #[test]
    fn cors_wildcard_allows_all() {
        let state = state_with("", SEGMENT_CACHE_TTL, &["*"]);
        assert_eq!(
            state.cors_origin(Some("https://example.com")),
            Some("https://example.com".to_string())
        );
        assert_eq!(state.cors_origin(None), Some("*".to_string()));
    }

    #[test]
    fn cors_list_matches_exact_origin() {
        let state = state_with("", SEGMENT_CACHE_TTL, &["https://a.test", "https://b.test"]);
        assert_eq!(
            state.cors_origin(Some("https://b.test")),
            Some("https://b.test".to_string())
        );
        assert_eq!(state.cors_origin(Some("https://evil.test")), None);
        assert_eq!(state.cors_origin(None), None);
    }

    #[test]
    fn file_classification() {
        assert!(matches!(classify("master.m3u8"), HlsFile::Master));
        assert!(matches!(classify("playlist.m3u8"), HlsFile::Media(None)));
        match classify("playlist_720p.m3u8") {
            HlsFile::Media(Some(v)) => assert_eq!(v, "720p"),
            _ => panic!("expected variant playlist"),
        }
        assert!(matches!(classify("segment_42.ts"), HlsFile::Segment(42)));
        assert!(matches!(classify("segment_x.ts"), HlsFile::Unknown));
        assert!(matches!(classify("evil.txt"), HlsFile::Unknown));
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let cache = Arc::new(SegmentCache::new(Duration::ZERO));
        let cancel = CancellationToken::new();
        let handle = spawn_cache_sweeper(cache, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
