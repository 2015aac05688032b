// SFU signaling.
//
// JSON messages over a WebSocket: a publisher sends `offer` and receives
// the answer; a subscriber sends `subscribe`, receives the server's offer
// (its outbound tracks), and replies with `answer`. `candidate` carries
// trickle ICE both ways.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::message::Metadata;
use crate::peer::{Publisher, Subscriber};
use crate::sfu::Sfu;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Subscribe,
    Unsubscribe,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default)]
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl SignalMessage {
    fn reply(kind: SignalKind, stream_id: &str, peer_id: &str) -> Self {
        Self {
            kind,
            stream_id: stream_id.to_string(),
            peer_id: peer_id.to_string(),
            sdp: None,
            candidate: None,
            error: None,
            metadata: None,
        }
    }

    pub fn answer(stream_id: &str, peer_id: &str, sdp: String) -> Self {
        let mut msg = Self::reply(SignalKind::Answer, stream_id, peer_id);
        msg.sdp = Some(sdp);
        msg
    }

    pub fn offer(stream_id: &str, peer_id: &str, sdp: String) -> Self {
        let mut msg = Self::reply(SignalKind::Offer, stream_id, peer_id);
        msg.sdp = Some(sdp);
        msg
    }

    pub fn error(stream_id: &str, peer_id: &str, error: impl Into<String>) -> Self {
        let mut msg = Self::reply(SignalKind::Error, stream_id, peer_id);
        msg.error = Some(error.into());
        msg
    }
}

// ---------------------------------------------------------------------------
// WebSocket endpoint
// ---------------------------------------------------------------------------

/// GET /sfu/ws
pub async fn sfu_ws_handler(
    State(state): State<Arc<crate::AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let sfu = Arc::clone(&state.sfu);
    ws.on_upgrade(move |socket| handle_signal_socket(sfu, socket))
}

/// Everything one signaling socket has attached to the SFU; torn down when
/// the socket goes away.
#[derive(Default)]
struct SignalSession {
    publisher: Option<Arc<Publisher>>,
    subscribers: HashMap<String, Arc<Subscriber>>,
}

async fn handle_signal_socket(sfu: Arc<Sfu>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut session = SignalSession::default();
    let ice_timeout = sfu.config().ice_timeout_secs;
    let connect_timeout = Duration::from_secs(sfu.config().connect_timeout_secs);

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let inbound: SignalMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("signaling: undecodable frame: {err}");
                let reply = SignalMessage::error("", "", "invalid signal message");
                send_signal(&mut sink, &reply).await;
                continue;
            }
        };

        // Bound the whole attach-and-negotiate exchange.
        let stream_id = inbound.stream_id.clone();
        let peer_id = inbound.peer_id.clone();
        let reply = match tokio::time::timeout(
            connect_timeout,
            dispatch(&sfu, &mut session, inbound, ice_timeout),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => {
                warn!("signaling: negotiation with '{peer_id}' timed out");
                Some(SignalMessage::error(
                    &stream_id,
                    &peer_id,
                    "negotiation timed out",
                ))
            }
        };
        if let Some(reply) = reply {
            send_signal(&mut sink, &reply).await;
        }
    }

    // Socket gone: detach everything this session attached.
    if let Some(publisher) = session.publisher.take() {
        if let Ok(stream) = sfu.get_stream(&publisher.stream_id) {
            stream.remove_publisher();
        }
        publisher.stop().await;
        info!("signaling: publisher '{}' detached", publisher.id);
    }
    for (stream_id, subscriber) in session.subscribers.drain() {
        if let Ok(stream) = sfu.get_stream(&stream_id) {
            stream.remove_subscriber(&subscriber.id);
        }
        subscriber.stop().await;
    }
}

async fn dispatch(
    sfu: &Arc<Sfu>,
    session: &mut SignalSession,
    inbound: SignalMessage,
    ice_timeout: u64,
) -> Option<SignalMessage> {
    let stream_id = inbound.stream_id.clone();
    let peer_id = inbound.peer_id.clone();

    match inbound.kind {
        // Publisher: remote offer in, local answer out.
        SignalKind::Offer => {
            let sdp = match inbound.sdp {
                Some(sdp) => sdp,
                None => return Some(SignalMessage::error(&stream_id, &peer_id, "offer without sdp")),
            };
            let publisher = match sfu.attach_publisher(&stream_id, &peer_id).await {
                Ok(publisher) => publisher,
                Err(err) => {
                    warn!("signaling: publish to '{stream_id}' refused: {err}");
                    return Some(SignalMessage::error(&stream_id, &peer_id, err.to_string()));
                }
            };
            match publisher.handle_offer(sdp, ice_timeout).await {
                Ok(answer) => {
                    session.publisher = Some(publisher);
                    Some(SignalMessage::answer(&stream_id, &peer_id, answer))
                }
                Err(err) => {
                    if let Ok(stream) = sfu.get_stream(&stream_id) {
                        stream.remove_publisher();
                    }
                    publisher.stop().await;
                    Some(SignalMessage::error(&stream_id, &peer_id, err.to_string()))
                }
            }
        }

        // Subscriber: attach, send our offer with the outbound tracks.
        SignalKind::Subscribe => {
            let subscriber = match sfu.attach_subscriber(&stream_id, &peer_id).await {
                Ok(subscriber) => subscriber,
                Err(err) => {
                    warn!("signaling: subscribe to '{stream_id}' refused: {err}");
                    return Some(SignalMessage::error(&stream_id, &peer_id, err.to_string()));
                }
            };
            match subscriber.handle_offer(ice_timeout).await {
                Ok(offer) => {
                    session.subscribers.insert(stream_id.clone(), subscriber);
                    Some(SignalMessage::offer(&stream_id, &peer_id, offer))
                }
                Err(err) => {
                    if let Ok(stream) = sfu.get_stream(&stream_id) {
                        stream.remove_subscriber(&subscriber.id);
                    }
                    subscriber.stop().await;
                    Some(SignalMessage::error(&stream_id, &peer_id, err.to_string()))
                }
            }
        }

        // Subscriber's answer to our offer.
        SignalKind::Answer => {
            let sdp = match inbound.sdp {
                Some(sdp) => sdp,
                None => return Some(SignalMessage::error(&stream_id, &peer_id, "answer without sdp")),
            };
            match session.subscribers.get(&stream_id) {
                Some(subscriber) => match subscriber.handle_answer(sdp).await {
                    Ok(()) => None,
                    Err(err) => Some(SignalMessage::error(&stream_id, &peer_id, err.to_string())),
                },
                None => Some(SignalMessage::error(
                    &stream_id,
                    &peer_id,
                    "no subscription for this stream",
                )),
            }
        }

        SignalKind::Candidate => {
            let candidate = match inbound.candidate {
                Some(candidate) => candidate,
                None => return None,
            };
            let init = RTCIceCandidateInit {
                candidate,
                ..Default::default()
            };

            let pc = session
                .subscribers
                .get(&stream_id)
                .and_then(|s| s.pc.clone())
                .or_else(|| {
                    session
                        .publisher
                        .as_ref()
                        .filter(|p| p.stream_id == stream_id)
                        .map(|p| Arc::clone(&p.pc))
                });
            if let Some(pc) = pc {
                if let Err(err) = pc.add_ice_candidate(init).await {
                    debug!("signaling: add_ice_candidate failed: {err}");
                }
            }
            None
        }

        SignalKind::Unsubscribe => {
            if let Some(subscriber) = session.subscribers.remove(&stream_id) {
                if let Ok(stream) = sfu.get_stream(&stream_id) {
                    stream.remove_subscriber(&subscriber.id);
                }
                subscriber.stop().await;
            }
            None
        }

        SignalKind::Error => {
            warn!(
                "signaling: peer '{peer_id}' reported error on '{stream_id}': {}",
                inbound.error.as_deref().unwrap_or("(none)")
            );
            None
        }
    }
}

async fn send_signal(
    sink: &mut (impl SinkExt<WsMessage> + Unpin),
    message: &SignalMessage,
) {
    match serde_json::to_string(message) {
        Ok(json) => {
            if sink.send(WsMessage::Text(json)).await.is_err() {
                debug!("signaling: reply send failed");
            }
        }
        Err(err) => warn!("signaling: serialization failed: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
