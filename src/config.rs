use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `STREAMCAST_`.  Defaults are suitable for local development.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,

    // ── HLS ─────────────────────────────────────────────────────────────
    pub hls: HlsConfig,

    // ── SFU ─────────────────────────────────────────────────────────────
    pub sfu: SfuConfig,

    // ── Chat ────────────────────────────────────────────────────────────
    pub chat: ChatConfig,

    // ── CORS ────────────────────────────────────────────────────────────
    /// Comma-separated list of allowed origins, or `*` for permissive.
    pub allowed_origins: String,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

/// HLS transmuxer and playlist settings.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Target segment duration in seconds.
    pub segment_duration: f64,
    /// Number of segments retained in a live playlist when DVR is off.
    pub playlist_size: usize,
    /// Enable the DVR sliding window.
    pub dvr_enabled: bool,
    /// DVR window size in seconds.
    pub dvr_window_secs: f64,
    /// Directory segments and playlists are persisted to. Empty disables
    /// persistence.
    pub output_dir: String,
    /// Nominal video frame rate, used to derive the PCR advance.
    pub frame_rate: f64,
    /// Enable adaptive-bitrate variant playlists.
    pub abr_enabled: bool,
}

/// SFU limits and WebRTC timeouts.
#[derive(Debug, Clone)]
pub struct SfuConfig {
    /// Maximum subscribers attached to a single stream.
    pub max_subscribers_per_stream: usize,
    /// Bound on ICE candidate gathering, seconds.
    pub ice_timeout_secs: u64,
    /// Bound on peer-connection establishment, seconds.
    pub connect_timeout_secs: u64,
    /// STUN server URLs for server-side ICE gathering.
    pub stun_urls: Vec<String>,
}

/// Chat ingress settings.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Messages allowed per user per window.
    pub rate_limit_max: u32,
    /// Rate-limit window length in seconds.
    pub rate_limit_window_secs: u64,
    /// Keep-alive ping interval, seconds.
    pub ping_interval_secs: u64,
    /// Disconnect if no pong within this many seconds.
    pub pong_timeout_secs: u64,
    /// Per-connection send deadline during broadcast, milliseconds.
    pub send_deadline_ms: u64,
    /// Minimum message length (code points).
    pub min_message_len: usize,
    /// Maximum message length (code points).
    pub max_message_len: usize,
    /// Permit messages that contain URLs.
    pub allow_urls: bool,
    /// Permit emoji characters in messages.
    pub allow_emojis: bool,
    /// Case-insensitive blocked substrings.
    pub blocked_words: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let bind_addr = env_or("STREAMCAST_BIND_ADDR", "0.0.0.0:8080");

        let hls = HlsConfig {
            segment_duration: env_f64("STREAMCAST_HLS_SEGMENT_DURATION", 6.0),
            playlist_size: env_usize("STREAMCAST_HLS_PLAYLIST_SIZE", 6),
            dvr_enabled: env_bool("STREAMCAST_HLS_DVR_ENABLED", false),
            dvr_window_secs: env_f64("STREAMCAST_HLS_DVR_WINDOW_SECS", 300.0),
            output_dir: env_or("STREAMCAST_HLS_OUTPUT_DIR", "./hls"),
            frame_rate: env_f64("STREAMCAST_HLS_FRAME_RATE", 25.0),
            abr_enabled: env_bool("STREAMCAST_HLS_ABR_ENABLED", false),
        };

        let sfu = SfuConfig {
            max_subscribers_per_stream: env_usize("STREAMCAST_SFU_MAX_SUBSCRIBERS", 100),
            ice_timeout_secs: env_u64("STREAMCAST_SFU_ICE_TIMEOUT_SECS", 5),
            connect_timeout_secs: env_u64("STREAMCAST_SFU_CONNECT_TIMEOUT_SECS", 30),
            stun_urls: env_csv(
                "STREAMCAST_SFU_STUN_URLS",
                &["stun:stun.l.google.com:19302"],
            ),
        };

        let chat = ChatConfig {
            rate_limit_max: env_u64("STREAMCAST_CHAT_RATE_LIMIT_MAX", 10) as u32,
            rate_limit_window_secs: env_u64("STREAMCAST_CHAT_RATE_LIMIT_WINDOW_SECS", 60),
            ping_interval_secs: env_u64("STREAMCAST_CHAT_PING_INTERVAL_SECS", 30),
            pong_timeout_secs: env_u64("STREAMCAST_CHAT_PONG_TIMEOUT_SECS", 75),
            send_deadline_ms: env_u64("STREAMCAST_CHAT_SEND_DEADLINE_MS", 5000),
            min_message_len: env_usize("STREAMCAST_CHAT_MIN_MESSAGE_LEN", 1),
            max_message_len: env_usize("STREAMCAST_CHAT_MAX_MESSAGE_LEN", 500),
            allow_urls: env_bool("STREAMCAST_CHAT_ALLOW_URLS", false),
            allow_emojis: env_bool("STREAMCAST_CHAT_ALLOW_EMOJIS", true),
            blocked_words: env_csv("STREAMCAST_CHAT_BLOCKED_WORDS", &[]),
        };

        let allowed_origins = env_or("STREAMCAST_ALLOWED_ORIGINS", "*");
        let log_level = env_or("STREAMCAST_LOG_LEVEL", "info");

        let config = Config {
            bind_addr,
            hls,
            sfu,
            chat,
            allowed_origins,
            log_level,
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── StreamCast Configuration ────");
        info!("  bind_addr            : {}", self.bind_addr);
        info!("  hls.segment_duration : {}s", self.hls.segment_duration);
        info!("  hls.playlist_size    : {}", self.hls.playlist_size);
        info!(
            "  hls.dvr              : {} ({}s window)",
            self.hls.dvr_enabled, self.hls.dvr_window_secs
        );
        info!(
            "  hls.output_dir       : {}",
            if self.hls.output_dir.is_empty() {
                "(persistence disabled)"
            } else {
                &self.hls.output_dir
            }
        );
        info!("  hls.abr_enabled      : {}", self.hls.abr_enabled);
        info!(
            "  sfu.max_subscribers  : {}",
            self.sfu.max_subscribers_per_stream
        );
        info!("  sfu.stun_urls        : {:?}", self.sfu.stun_urls);
        info!(
            "  chat.rate_limit      : {}/{}s",
            self.chat.rate_limit_max, self.chat.rate_limit_window_secs
        );
        info!(
            "  cors_origins         : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level            : {}", self.log_level);
        info!("──────────────────────────────────");
    }
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_duration: 6.0,
            playlist_size: 6,
            dvr_enabled: false,
            dvr_window_secs: 300.0,
            output_dir: String::new(),
            frame_rate: 25.0,
            abr_enabled: false,
        }
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_subscribers_per_stream: 100,
            ice_timeout_secs: 5,
            connect_timeout_secs: 30,
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
            ping_interval_secs: 30,
            pong_timeout_secs: 75,
            send_deadline_ms: 5000,
            min_message_len: 1,
            max_message_len: 500,
            allow_urls: false,
            allow_emojis: true,
            blocked_words: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(v) => v.parse::<f64>().unwrap_or_else(|_| {
            warn!("{key}: '{v}' is not a number, using {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let hls = HlsConfig::default();
        assert!(hls.segment_duration > 0.0);
        assert!(hls.playlist_size > 0);

        let chat = ChatConfig::default();
        assert!(chat.rate_limit_max > 0);
        assert!(chat.min_message_len <= chat.max_message_len);
    }

    #[test]
    fn env_csv_splits_and_trims() {
        std::env::set_var("STREAMCAST_TEST_CSV", "a, b ,,c");
        let v = env_csv("STREAMCAST_TEST_CSV", &[]);
        assert_eq!(v, vec!["a", "b", "c"]);
        std::env::remove_var("STREAMCAST_TEST_CSV");
    }

    #[test]
    fn env_bool_accepts_variants() {
        std::env::set_var("STREAMCAST_TEST_BOOL", "YES");
        assert!(env_bool("STREAMCAST_TEST_BOOL", false));
        std::env::set_var("STREAMCAST_TEST_BOOL", "0");
        assert!(!env_bool("STREAMCAST_TEST_BOOL", true));
        std::env::remove_var("STREAMCAST_TEST_BOOL");
    }
}
