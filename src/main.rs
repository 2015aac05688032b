mod api;
mod bandwidth;
mod chat_room;
mod chat_server;
mod config;
mod dvr;
mod error;
mod hls_http;
mod message;
mod moderation;
mod peer;
mod playlist;
mod rate_limit;
mod segment;
mod sfu;
mod signal;
mod transmuxer;
mod ts;
mod validate;

use axum::{
    http::{HeaderName, HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: config::Config,
    pub transmuxer: Arc<transmuxer::Transmuxer>,
    pub sfu: Arc<sfu::Sfu>,
    pub chat: Arc<chat_server::ChatServer>,
    pub hls: Arc<hls_http::HlsState>,
}

// ─── CORS configuration ─────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("range"),
            ])
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cfg = {
        // Read the log level before installing the subscriber.
        let log_level =
            std::env::var("STREAMCAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
            )
            .init();
        config::Config::from_env()
    };

    // ── Output directory ────────────────────────────────────────────────
    if !cfg.hls.output_dir.is_empty() {
        if let Err(err) = std::fs::create_dir_all(&cfg.hls.output_dir) {
            error!("cannot create output directory '{}': {err}", cfg.hls.output_dir);
            std::process::exit(1);
        }
    }

    // ── Core subsystems ─────────────────────────────────────────────────
    let transmuxer = {
        let mux = transmuxer::Transmuxer::new(cfg.hls.clone());
        Arc::new(if cfg.hls.abr_enabled {
            mux.with_variants(transmuxer::default_variants())
        } else {
            mux
        })
    };
    let sfu = Arc::new(sfu::Sfu::new(cfg.sfu.clone()));
    let chat = Arc::new(chat_server::ChatServer::new(cfg.chat.clone()));
    let cache = Arc::new(hls_http::SegmentCache::new(hls_http::SEGMENT_CACHE_TTL));

    let allowed_origins: Vec<String> = cfg
        .allowed_origins
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let hls_state = Arc::new(hls_http::HlsState {
        transmuxer: Arc::clone(&transmuxer),
        cache: Arc::clone(&cache),
        output_dir: cfg.hls.output_dir.clone(),
        allowed_origins,
    });

    // ── Background sweepers ─────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let _cache_sweeper = hls_http::spawn_cache_sweeper(Arc::clone(&cache), shutdown.child_token());
    let _mod_sweeper = moderation::spawn_moderation_sweeper(
        Arc::clone(chat.moderator()),
        Duration::from_secs(60),
        shutdown.child_token(),
    );
    let _rl_sweeper = rate_limit::spawn_rate_limit_sweeper(
        Arc::clone(chat.rate_limiter()),
        Duration::from_secs(60),
        shutdown.child_token(),
    );
    let _stats_monitor = sfu::spawn_stats_monitor(
        Arc::clone(&sfu),
        Duration::from_secs(5),
        shutdown.child_token(),
    );

    let bind_addr = cfg.bind_addr.clone();
    let cors = build_cors_layer(&cfg.allowed_origins);

    let state = Arc::new(AppState {
        config: cfg,
        transmuxer,
        sfu,
        chat,
        hls: hls_state,
    });

    // ── Router ──────────────────────────────────────────────────────────
    // The CORS layer covers the REST and WebSocket surface; the HLS
    // delivery routes apply their own origin-echo headers.
    let api_routes = Router::new()
        // Health (no auth required)
        .route("/health", get(api::health_handler))
        // SFU streams
        .route("/v1/streams", post(api::create_sfu_stream))
        .route("/v1/streams", get(api::list_sfu_streams))
        .route("/v1/streams/:stream_id", get(api::get_sfu_stream))
        .route("/v1/streams/:stream_id", delete(api::delete_sfu_stream))
        // Chat rooms
        .route("/v1/rooms", post(api::create_chat_room))
        .route("/v1/rooms", get(api::list_chat_rooms))
        .route("/v1/rooms/:room_id", delete(api::delete_chat_room))
        // Moderation
        .route("/v1/rooms/:room_id/ban", post(api::ban_user))
        .route("/v1/rooms/:room_id/unban", post(api::unban_user))
        .route("/v1/rooms/:room_id/mute", post(api::mute_user))
        .route("/v1/rooms/:room_id/unmute", post(api::unmute_user))
        .route("/v1/rooms/:room_id/moderation", get(api::get_moderation_state))
        // HLS stream control
        .route("/v1/hls/:stream_key/start", post(api::start_hls_stream))
        .route("/v1/hls/:stream_key/stop", post(api::stop_hls_stream))
        .route("/v1/hls/:stream_key", get(api::get_hls_stream))
        // WebSocket ingress
        .route("/chat/ws", get(chat_server::chat_ws_handler))
        .route("/sfu/ws", get(signal::sfu_ws_handler))
        .layer(cors);

    let hls_routes = Router::new()
        .route("/", get(hls_http::index))
        .route(
            "/:stream_key/:file",
            get(hls_http::serve_file).options(hls_http::preflight),
        );

    let app = api_routes.merge(hls_routes).with_state(state);

    // ── Serve ───────────────────────────────────────────────────────────
    info!("StreamCast listening on http://{bind_addr}");
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind '{bind_addr}': {err}");
            std::process::exit(1);
        }
    };

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!("server error: {err}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    shutdown.cancel();
}
