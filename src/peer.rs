// Publisher / Subscriber peers.
//
// Thin lifecycle wrappers around webrtc-rs peer connections: the publisher
// binds a remote peer's inbound tracks and pumps RTP into the stream's
// fan-out; the subscriber owns two local outbound tracks the fan-out writes
// into. Both share the same connection state machine.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::util::marshal::MarshalSize;

use crate::config::SfuConfig;
use crate::error::{Error, Result};

// ─── PeerState ──────────────────────────────────────────────────────────────

/// Connection state machine shared by publishers and subscribers.
///
/// `Disconnected`, `Failed` and `Closed` are terminal for packet flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Map the engine's connection state onto ours.
pub fn peer_state_from(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

/// Shared state-machine cell: current state plus the CONNECTED timestamp.
pub struct PeerStateCell {
    state: RwLock<PeerState>,
    connected_at: RwLock<Option<Instant>>,
}

impl PeerStateCell {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PeerState::New),
            connected_at: RwLock::new(None),
        }
    }

    pub fn transition(&self, next: PeerState) {
        let mut state = self.state.write().unwrap();
        if *state == next {
            return;
        }
        if next == PeerState::Connected {
            *self.connected_at.write().unwrap() = Some(Instant::now());
        }
        *state = next;
    }

    pub fn get(&self) -> PeerState {
        *self.state.read().unwrap()
    }

    pub fn connected_at(&self) -> Option<Instant> {
        *self.connected_at.read().unwrap()
    }
}

impl Default for PeerStateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ─── PeerStats ──────────────────────────────────────────────────────────────

/// Forwarding counters kept with atomics; float metrics behind a lock.
#[derive(Default)]
pub struct PeerStats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_lost: AtomicU64,
    metrics: RwLock<PeerMetrics>,
}

#[derive(Default, Clone)]
struct PeerMetrics {
    jitter: f64,
    rtt_ms: f64,
    bitrate: u64,
    last_updated: Option<std::time::SystemTime>,
}

/// Serialisable snapshot for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub jitter: f64,
    pub rtt_ms: f64,
    pub bitrate: u64,
}

impl PeerStats {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn update_metrics(&self, jitter: f64, rtt_ms: f64, bitrate: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.jitter = jitter;
        metrics.rtt_ms = rtt_ms;
        metrics.bitrate = bitrate;
        metrics.last_updated = Some(std::time::SystemTime::now());
    }

    pub fn snapshot(&self) -> PeerStatsSnapshot {
        let metrics = self.metrics.read().unwrap().clone();
        PeerStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            jitter: metrics.jitter,
            rtt_ms: metrics.rtt_ms,
            bitrate: metrics.bitrate,
        }
    }
}

// ─── PeerConnection factory ─────────────────────────────────────────────────

/// Create a new `RTCPeerConnection` with default codecs, interceptors and
/// the configured STUN servers.
pub async fn create_peer_connection(
    cfg: &SfuConfig,
) -> std::result::Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers: Vec<RTCIceServer> = cfg
        .stun_urls
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

// ─── RTP seams ──────────────────────────────────────────────────────────────

/// Where the fan-out writes a subscriber's packets. Implemented by the
/// webrtc local track in production and by capture sinks in tests.
#[async_trait]
pub trait RtpOutbound: Send + Sync {
    async fn write_rtp(&self, pkt: &webrtc::rtp::packet::Packet)
        -> std::result::Result<(), webrtc::Error>;
}

/// Production outbound: a `TrackLocalStaticRTP` bound to the peer.
pub struct LocalRtpTrack(pub Arc<TrackLocalStaticRTP>);

#[async_trait]
impl RtpOutbound for LocalRtpTrack {
    async fn write_rtp(
        &self,
        pkt: &webrtc::rtp::packet::Packet,
    ) -> std::result::Result<(), webrtc::Error> {
        self.0.write_rtp(pkt).await.map(|_| ())
    }
}

/// The per-stream fan-out a publisher pumps its RTP into.
#[async_trait]
pub trait RtpFanout: Send + Sync {
    async fn forward_video(&self, pkt: &webrtc::rtp::packet::Packet);
    async fn forward_audio(&self, pkt: &webrtc::rtp::packet::Packet);
}

// ─── Publisher ──────────────────────────────────────────────────────────────

pub type PublishCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The single media source of a stream.
///
/// Lifecycle: idle until `start`, running once the first RTP arrives from
/// the remote peer, stopped on `stop` (terminal).
pub struct Publisher {
    pub id: String,
    pub stream_id: String,
    pub pc: Arc<RTCPeerConnection>,
    pub state: PeerStateCell,
    pub stats: Arc<PeerStats>,
    is_publishing: AtomicBool,
    fanout: RwLock<Option<Arc<dyn RtpFanout>>>,
    on_publish_start: RwLock<Option<PublishCallback>>,
    on_publish_stop: RwLock<Option<PublishCallback>>,
}

impl Publisher {
    pub fn new(id: String, stream_id: String, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            id,
            stream_id,
            pc,
            state: PeerStateCell::new(),
            stats: Arc::new(PeerStats::default()),
            is_publishing: AtomicBool::new(false),
            fanout: RwLock::new(None),
            on_publish_start: RwLock::new(None),
            on_publish_stop: RwLock::new(None),
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.is_publishing.load(Ordering::Relaxed)
    }

    pub fn set_fanout(&self, fanout: Arc<dyn RtpFanout>) {
        *self.fanout.write().unwrap() = Some(fanout);
    }

    pub fn set_on_publish_start(&self, cb: PublishCallback) {
        *self.on_publish_start.write().unwrap() = Some(cb);
    }

    pub fn set_on_publish_stop(&self, cb: PublishCallback) {
        *self.on_publish_stop.write().unwrap() = Some(cb);
    }

    /// Register the on_track RTP pumps and the connection-state hook.
    /// Must be called before the SDP exchange so early packets are not lost.
    pub fn start(self: &Arc<Self>) {
        let publisher = Arc::clone(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let publisher = Arc::clone(&publisher);
            Box::pin(async move {
                let kind = track.kind();
                info!(
                    "stream '{}' — publisher '{}' track: kind={kind}, ssrc={}",
                    publisher.stream_id,
                    publisher.id,
                    track.ssrc()
                );

                let is_video = kind == RTPCodecType::Video;
                tokio::spawn(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((pkt, _)) => {
                                if !publisher.is_publishing.swap(true, Ordering::Relaxed) {
                                    publisher.notify_publish_start();
                                }
                                publisher
                                    .stats
                                    .record_received(pkt.payload.len() + pkt.header.marshal_size());
                                let fanout = publisher.fanout.read().unwrap().clone();
                                if let Some(fanout) = fanout {
                                    if is_video {
                                        fanout.forward_video(&pkt).await;
                                    } else {
                                        fanout.forward_audio(&pkt).await;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(
                                    "publisher '{}': RTP read ended ({kind}): {err}",
                                    publisher.id
                                );
                                break;
                            }
                        }
                    }
                });
            })
        }));

        let publisher = Arc::clone(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |conn_state| {
                let publisher = Arc::clone(&publisher);
                Box::pin(async move {
                    let next = peer_state_from(conn_state);
                    publisher.state.transition(next);
                    if next.is_terminal()
                        && publisher.is_publishing.swap(false, Ordering::Relaxed)
                    {
                        publisher.notify_publish_stop();
                    }
                })
            }));
    }

    fn notify_publish_start(&self) {
        if let Some(cb) = self.on_publish_start.read().unwrap().clone() {
            let id = self.id.clone();
            tokio::spawn(async move { cb(&id) });
        }
    }

    fn notify_publish_stop(&self) {
        if let Some(cb) = self.on_publish_stop.read().unwrap().clone() {
            let id = self.id.clone();
            tokio::spawn(async move { cb(&id) });
        }
    }

    /// Consume the remote offer and produce the local answer, ICE-complete.
    pub async fn handle_offer(&self, offer_sdp: String, ice_timeout_secs: u64) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| Error::invalid_argument(format!("invalid SDP offer: {e}")))?;

        self.state.transition(PeerState::Connecting);

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::transient(format!("set_remote_description failed: {e}")))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::transient(format!("create_answer failed: {e}")))?;

        // Armed before set_local_description so the completion event cannot
        // slip past us.
        let mut gather_done = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::transient(format!("set_local_description failed: {e}")))?;

        // Cap the wait: a stalled gatherer must not hang the handshake, and
        // the SDP still carries whatever candidates arrived in time.
        let _ = tokio::time::timeout(
            Duration::from_secs(ice_timeout_secs),
            gather_done.recv(),
        )
        .await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::transient("local description unavailable after ICE gathering"))?;
        Ok(local.sdp)
    }

    /// Terminal stop: close the peer connection.
    pub async fn stop(&self) {
        if self.is_publishing.swap(false, Ordering::Relaxed) {
            self.notify_publish_stop();
        }
        self.state.transition(PeerState::Closed);
        if let Err(err) = self.pc.close().await {
            warn!("publisher '{}': close failed: {err}", self.id);
        }
    }
}

// ─── Subscriber ─────────────────────────────────────────────────────────────

/// One media sink of a stream: two local outbound tracks the fan-out writes
/// RTP into, attached `sendonly` to the subscriber's peer.
pub struct Subscriber {
    pub id: String,
    pub stream_id: String,
    pub pc: Option<Arc<RTCPeerConnection>>,
    pub video_out: Arc<dyn RtpOutbound>,
    pub audio_out: Arc<dyn RtpOutbound>,
    pub state: PeerStateCell,
    pub stats: Arc<PeerStats>,
    is_subscribed: AtomicBool,
}

impl Subscriber {
    /// Create the subscriber's local tracks and add them to the peer with a
    /// `sendonly` transceiver direction hint.
    pub async fn new(
        id: String,
        stream_id: String,
        pc: Arc<RTCPeerConnection>,
    ) -> Result<Arc<Self>> {
        let video_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_string(),
            format!("streamcast-{stream_id}"),
        ));
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            format!("streamcast-{stream_id}"),
        ));

        for track in [
            Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>,
        ] {
            pc.add_transceiver_from_track(
                track,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| Error::transient(format!("add_transceiver failed: {e}")))?;
        }

        let subscriber = Arc::new(Self {
            id,
            stream_id,
            pc: Some(Arc::clone(&pc)),
            video_out: Arc::new(LocalRtpTrack(video_track)),
            audio_out: Arc::new(LocalRtpTrack(audio_track)),
            state: PeerStateCell::new(),
            stats: Arc::new(PeerStats::default()),
            is_subscribed: AtomicBool::new(false),
        });

        let sub = Arc::clone(&subscriber);
        pc.on_peer_connection_state_change(Box::new(move |conn_state| {
            let sub = Arc::clone(&sub);
            Box::pin(async move {
                sub.state.transition(peer_state_from(conn_state));
            })
        }));

        Ok(subscriber)
    }

    /// Detached subscriber writing into injected sinks; no peer engine.
    #[cfg(test)]
    pub(crate) fn detached(
        id: &str,
        stream_id: &str,
        video_out: Arc<dyn RtpOutbound>,
        audio_out: Arc<dyn RtpOutbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            pc: None,
            video_out,
            audio_out,
            state: PeerStateCell::new(),
            stats: Arc::new(PeerStats::default()),
            is_subscribed: AtomicBool::new(false),
        })
    }

    pub fn is_subscribed(&self) -> bool {
        self.is_subscribed.load(Ordering::Relaxed)
    }

    /// Mark running. Tracks were created and added before the local offer,
    /// so the SDP already announces them.
    pub fn start(&self) {
        self.is_subscribed.store(true, Ordering::Relaxed);
    }

    /// Create the local offer announcing the outbound tracks.
    pub async fn handle_offer(&self, ice_timeout_secs: u64) -> Result<String> {
        let pc = self
            .pc
            .as_ref()
            .ok_or_else(|| Error::precondition("subscriber has no peer connection"))?;

        self.state.transition(PeerState::Connecting);

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::transient(format!("create_offer failed: {e}")))?;

        let mut gather_done = pc.gathering_complete_promise().await;

        pc.set_local_description(offer)
            .await
            .map_err(|e| Error::transient(format!("set_local_description failed: {e}")))?;

        let _ = tokio::time::timeout(
            Duration::from_secs(ice_timeout_secs),
            gather_done.recv(),
        )
        .await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::transient("local description unavailable after ICE gathering"))?;
        Ok(local.sdp)
    }

    /// Consume the remote answer.
    pub async fn handle_answer(&self, answer_sdp: String) -> Result<()> {
        let pc = self
            .pc
            .as_ref()
            .ok_or_else(|| Error::precondition("subscriber has no peer connection"))?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| Error::invalid_argument(format!("invalid SDP answer: {e}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| Error::transient(format!("set_remote_description failed: {e}")))?;
        Ok(())
    }

    /// Terminal stop: close the peer connection.
    pub async fn stop(&self) {
        self.is_subscribed.store(false, Ordering::Relaxed);
        self.state.transition(PeerState::Closed);
        if let Some(pc) = &self.pc {
            if let Err(err) = pc.close().await {
                warn!("subscriber '{}': close failed: {err}", self.id);
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let cell = PeerStateCell::new();
        assert_eq!(cell.get(), PeerState::New);
        assert!(cell.connected_at().is_none());

        cell.transition(PeerState::Connecting);
        assert_eq!(cell.get(), PeerState::Connecting);

        cell.transition(PeerState::Connected);
        assert_eq!(cell.get(), PeerState::Connected);
        assert!(cell.connected_at().is_some());

        cell.transition(PeerState::Disconnected);
        assert!(cell.get().is_terminal());

        cell.transition(PeerState::Closed);
        assert_eq!(cell.get(), PeerState::Closed);
    }

    #[test]
    fn engine_state_mapping() {
        assert_eq!(
            peer_state_from(RTCPeerConnectionState::Connecting),
            PeerState::Connecting
        );
        assert_eq!(
            peer_state_from(RTCPeerConnectionState::Connected),
            PeerState::Connected
        );
        assert_eq!(
            peer_state_from(RTCPeerConnectionState::Failed),
            PeerState::Failed
        );
        assert!(peer_state_from(RTCPeerConnectionState::Closed).is_terminal());
    }

    #[test]
    fn stats_counters_accumulate() {
        let stats = PeerStats::default();
        stats.record_sent(1200);
        stats.record_sent(800);
        stats.record_received(500);
        stats.update_metrics(1.5, 42.0, 2_000_000);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 2000);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_received, 500);
        assert_eq!(snap.rtt_ms, 42.0);
        assert_eq!(snap.bitrate, 2_000_000);
    }

    #[test]
    fn peer_state_display() {
        assert_eq!(PeerState::Connected.to_string(), "connected");
        assert_eq!(PeerState::Failed.to_string(), "failed");
    }
}
