// Chat ingress.
//
// WebSocket upgrade with mandatory identity query parameters, a send-mutex
// around each socket's sink, a ping/pong keep-alive driver, and the
// per-message pipeline: typing → rate limit → mute → validate → broadcast.
// Rejections go back to the sender only, as system messages.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat_room::{ChatRoom, Connection, Role, RoomInfo, User};
use crate::config::ChatConfig;
use crate::error::{ApiError, Error, Result};
use crate::message::{Message, MessageType};
use crate::moderation::{ModAction, Moderator};
use crate::rate_limit::RateLimiter;
use crate::validate::MessageValidator;

pub type MessageHook = Arc<dyn Fn(&Message) + Send + Sync>;
/// `(room_id, user_id)` presence/typing notification for collaborators.
pub type PresenceHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// ChatServer
// ---------------------------------------------------------------------------

/// Owns the room registry and the shared moderation/rate-limit/validation
/// machinery applied to every inbound message.
pub struct ChatServer {
    config: ChatConfig,
    rooms: RwLock<HashMap<String, Arc<ChatRoom>>>,
    rate_limiter: Arc<RateLimiter>,
    moderator: Arc<Moderator>,
    validator: MessageValidator,
    on_message: RwLock<Option<MessageHook>>,
    on_join: RwLock<Option<PresenceHook>>,
    on_leave: RwLock<Option<PresenceHook>>,
    on_typing: RwLock<Option<PresenceHook>>,
}

impl ChatServer {
    pub fn new(config: ChatConfig) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_max,
            Duration::from_secs(config.rate_limit_window_secs),
        ));
        let validator = MessageValidator::new(config.min_message_len, config.max_message_len)
            .with_urls_allowed(config.allow_urls)
            .with_emojis_allowed(config.allow_emojis)
            .with_blocked_words(config.blocked_words.clone());
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            rate_limiter,
            moderator: Arc::new(Moderator::new()),
            validator,
            on_message: RwLock::new(None),
            on_join: RwLock::new(None),
            on_leave: RwLock::new(None),
            on_typing: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn moderator(&self) -> &Arc<Moderator> {
        &self.moderator
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn set_on_message(&self, hook: MessageHook) {
        *self.on_message.write().unwrap() = Some(hook);
    }

    pub fn set_on_join(&self, hook: PresenceHook) {
        *self.on_join.write().unwrap() = Some(hook);
    }

    pub fn set_on_leave(&self, hook: PresenceHook) {
        *self.on_leave.write().unwrap() = Some(hook);
    }

    pub fn set_on_typing(&self, hook: PresenceHook) {
        *self.on_typing.write().unwrap() = Some(hook);
    }

    fn notify_presence(
        hook: &RwLock<Option<PresenceHook>>,
        room_id: &str,
        user_id: &str,
    ) {
        if let Some(hook) = hook.read().unwrap().clone() {
            let room_id = room_id.to_string();
            let user_id = user_id.to_string();
            tokio::spawn(async move { hook(&room_id, &user_id) });
        }
    }

    // ── Room lifecycle ──────────────────────────────────────────────────

    pub fn create_room(&self, id: &str, stream_id: &str, name: &str) -> Result<Arc<ChatRoom>> {
        if id.is_empty() {
            return Err(Error::invalid_argument("room id must not be empty"));
        }
        let mut rooms = self.rooms.write().unwrap();
        if rooms.contains_key(id) {
            return Err(Error::already_exists(format!("room '{id}'")));
        }
        let room = ChatRoom::new(
            id,
            stream_id,
            name,
            Duration::from_millis(self.config.send_deadline_ms),
        );
        rooms.insert(id.to_string(), Arc::clone(&room));
        info!("chat room '{id}' created (stream '{stream_id}')");
        Ok(room)
    }

    pub fn get_room(&self, id: &str) -> Result<Arc<ChatRoom>> {
        self.rooms
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("room '{id}'")))
    }

    /// Close the room and forget it.
    pub async fn delete_room(&self, id: &str) -> Result<()> {
        let room = {
            let mut rooms = self.rooms.write().unwrap();
            rooms
                .remove(id)
                .ok_or_else(|| Error::not_found(format!("room '{id}'")))?
        };
        room.close().await;
        info!("chat room '{id}' deleted");
        Ok(())
    }

    pub fn room_infos(&self) -> Vec<RoomInfo> {
        self.rooms
            .read()
            .unwrap()
            .values()
            .map(|r| r.info())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    // ── Moderation ──────────────────────────────────────────────────────

    /// Apply a moderation action on behalf of `actor_role`, enforcing the
    /// role matrix (broadcaster/admin: everything; moderator: everything
    /// but permanent bans; viewer: nothing).
    pub fn moderate(
        &self,
        room_id: &str,
        actor_role: Role,
        action: ModAction,
        target_user_id: &str,
        mute_duration: Option<Duration>,
    ) -> Result<()> {
        // The room must exist even for purely in-memory moderation state.
        self.get_room(room_id)?;

        if !crate::moderation::can_moderate(actor_role, action) {
            return Err(Error::unauthorized(format!(
                "role '{actor_role:?}' may not perform this moderation action"
            )));
        }

        match action {
            ModAction::Ban => self.moderator.ban_user(room_id, target_user_id),
            ModAction::Unban => self.moderator.unban_user(room_id, target_user_id),
            ModAction::Mute => {
                let duration = mute_duration.ok_or_else(|| {
                    Error::invalid_argument("mute requires a duration")
                })?;
                self.moderator.mute_user(room_id, target_user_id, duration);
            }
            ModAction::Unmute => self.moderator.unmute_user(room_id, target_user_id),
        }
        Ok(())
    }

    // ── Per-message pipeline ────────────────────────────────────────────

    /// Run one inbound frame through the pipeline. Rejections are delivered
    /// to the sender only; the error path is reserved for room-level
    /// failures (closed room, vanished user).
    pub async fn process_inbound(
        &self,
        room: &Arc<ChatRoom>,
        user_id: &str,
        username: &str,
        raw: &str,
    ) -> Result<()> {
        let mut message: Message = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("room '{}': undecodable frame from '{user_id}': {err}", room.id);
                room.send_to_user(user_id, Message::system(&room.id, "Invalid message format."))
                    .await?;
                return Ok(());
            }
        };

        // Stamp server-owned fields; clients cannot forge identity.
        message.id = uuid::Uuid::new_v4().to_string();
        message.room_id = room.id.clone();
        message.user_id = user_id.to_string();
        message.username = username.to_string();
        message.timestamp = chrono::Utc::now();

        if message.message_type == MessageType::Typing {
            room.set_user_typing(user_id, message.typing_flag()).await?;
            Self::notify_presence(&self.on_typing, &room.id, user_id);
            return Ok(());
        }

        if !self.rate_limiter.allow(user_id) {
            room.send_to_user(
                user_id,
                Message::system(
                    &room.id,
                    "You are sending messages too quickly. Please slow down.",
                ),
            )
            .await?;
            return Ok(());
        }

        if self.moderator.is_user_muted(&room.id, user_id) {
            room.send_to_user(
                user_id,
                Message::system(&room.id, "You are muted in this room."),
            )
            .await?;
            return Ok(());
        }

        if let Err(reason) = self.validator.validate(&message) {
            room.send_to_user(user_id, Message::system(&room.id, reason)).await?;
            return Ok(());
        }

        if let Some(hook) = self.on_message.read().unwrap().clone() {
            let snapshot = message.clone();
            tokio::spawn(async move { hook(&snapshot) });
        }
        room.broadcast_message(message).await
    }
}

// ---------------------------------------------------------------------------
// WebSocket plumbing
// ---------------------------------------------------------------------------

/// Required upgrade parameters; the upgrade is refused without them.
#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub role: Option<Role>,
}

/// A live socket: the sink behind a send-mutex so concurrent broadcasts and
/// keep-alive pings interleave whole frames, never bytes.
struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    deadline: Duration,
}

impl WsConnection {
    async fn send_raw(&self, frame: WsMessage) -> Result<()> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(self.deadline, sink.send(frame))
            .await
            .map_err(|_| Error::transient("websocket send deadline exceeded"))?
            .map_err(|e| Error::transient(format!("websocket send failed: {e}")))
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, message: &Message) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| Error::transient(format!("message serialization failed: {e}")))?;
        self.send_raw(WsMessage::Text(json)).await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    }
}

/// GET /chat/ws?room_id=…&user_id=…&username=…
pub async fn chat_ws_handler(
    State(state): State<Arc<crate::AppState>>,
    Query(params): Query<JoinParams>,
    ws: WebSocketUpgrade,
) -> std::result::Result<Response, ApiError> {
    if params.room_id.is_empty() || params.user_id.is_empty() || params.username.is_empty() {
        return Err(ApiError::bad_request(
            "room_id, user_id and username are required",
        ));
    }

    let chat = Arc::clone(&state.chat);
    let room = chat
        .get_room(&params.room_id)
        .map_err(|_| ApiError::room_not_found(&params.room_id))?;

    if chat.moderator.is_user_banned(&room.id, &params.user_id) {
        return Err(ApiError::bad_request("You are banned from this room."));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(chat, room, params, socket)))
}

async fn handle_socket(
    server: Arc<ChatServer>,
    room: Arc<ChatRoom>,
    params: JoinParams,
    socket: WebSocket,
) {
    let (sink, mut stream) = socket.split();
    let conn = Arc::new(WsConnection {
        sink: Mutex::new(sink),
        deadline: Duration::from_millis(server.config.send_deadline_ms),
    });

    let user = User::new(
        &params.user_id,
        &params.username,
        params.role.unwrap_or_default(),
    );
    if let Err(err) = room.add_user(user, Arc::clone(&conn) as Arc<dyn Connection>).await {
        warn!(
            "room '{}': join refused for '{}': {err}",
            room.id, params.user_id
        );
        let _ = conn.send(&Message::system(&room.id, err.to_string())).await;
        conn.close().await;
        return;
    }
    ChatServer::notify_presence(&server.on_join, &room.id, &params.user_id);

    // Keep-alive driver: ping on an interval, give up when pongs stop.
    let cancel = CancellationToken::new();
    let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));
    let keepalive = {
        let conn = Arc::clone(&conn);
        let cancel = cancel.clone();
        let last_pong = Arc::clone(&last_pong);
        let ping_interval = Duration::from_secs(server.config.ping_interval_secs);
        let pong_timeout = Duration::from_secs(server.config.pong_timeout_secs);
        let room_id = room.id.clone();
        let user_id = params.user_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if last_pong.lock().unwrap().elapsed() > pong_timeout {
                            warn!("room '{room_id}': '{user_id}' pong timeout");
                            cancel.cancel();
                            break;
                        }
                        if conn.send_raw(WsMessage::Ping(Vec::new())).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    // Read loop.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(err) = server
                            .process_inbound(&room, &params.user_id, &params.username, &text)
                            .await
                        {
                            warn!(
                                "room '{}': pipeline error for '{}': {err}",
                                room.id, params.user_id
                            );
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        *last_pong.lock().unwrap() = Instant::now();
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = conn.send_raw(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Binary(_))) => {
                        debug!("room '{}': ignoring binary frame", room.id);
                    }
                    Some(Err(err)) => {
                        debug!("room '{}': socket error: {err}", room.id);
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = keepalive.await;
    match room.remove_user(&params.user_id).await {
        Ok(()) => ChatServer::notify_presence(&server.on_leave, &room.id, &params.user_id),
        Err(err) => debug!("room '{}': cleanup: {err}", room.id),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_room::testing::MockConnection;

    fn server_with(max_rate: u32) -> ChatServer {
        ChatServer::new(ChatConfig {
            rate_limit_max: max_rate,
            rate_limit_window_secs: 60,
            ..ChatConfig::default()
        })
    }

    async fn join(
        server: &ChatServer,
        room_id: &str,
        user_id: &str,
        username: &str,
    ) -> Arc<MockConnection> {
        let conn = MockConnection::new();
        server
            .get_room(room_id)
            .unwrap()
            .add_user(User::new(user_id, username, Role::Viewer), conn.clone())
            .await
            .unwrap();
        conn
    }

    fn text_frame(content: &str) -> String {
        format!(r#"{{"type":"text","content":"{content}"}}"#)
    }

    fn texts_received(conn: &MockConnection) -> usize {
        conn.received()
            .iter()
            .filter(|m| m.message_type == MessageType::Text)
            .count()
    }

    #[tokio::test]
    async fn room_lifecycle() {
        let server = server_with(10);
        server.create_room("r1", "s1", "main").unwrap();
        assert!(matches!(
            server.create_room("r1", "s1", "again").unwrap_err(),
            Error::AlreadyExists(_)
        ));
        assert_eq!(server.room_count(), 1);

        server.delete_room("r1").await.unwrap();
        assert!(matches!(
            server.delete_room("r1").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    /// Scenario: limit 3 per window; the fourth message is rejected with a
    /// system notice to the sender only and never broadcast.
    #[tokio::test]
    async fn fourth_message_is_rate_limited() {
        let server = server_with(3);
        let room = server.create_room("r1", "s1", "main").unwrap();
        let sender = join(&server, "r1", "u1", "alice").await;
        let other = join(&server, "r1", "u2", "bob").await;

        for i in 0..4 {
            server
                .process_inbound(&room, "u1", "alice", &text_frame(&format!("msg {i}")))
                .await
                .unwrap();
        }

        assert_eq!(texts_received(&other), 3);
        assert_eq!(texts_received(&sender), 3);

        let rejection = sender
            .received()
            .into_iter()
            .filter(|m| m.message_type == MessageType::System)
            .last()
            .expect("sender got a rejection");
        assert!(rejection.content.contains("too quickly"));
        assert!(!other
            .received()
            .iter()
            .any(|m| m.message_type == MessageType::System));
    }

    /// Scenario: muted users are suppressed until the mute lapses.
    #[tokio::test]
    async fn muted_user_is_suppressed_then_recovers() {
        let server = server_with(100);
        let room = server.create_room("r1", "s1", "main").unwrap();
        let sender = join(&server, "r1", "u1", "alice").await;
        let other = join(&server, "r1", "u2", "bob").await;

        server
            .moderator()
            .mute_user("r1", "u1", Duration::from_millis(40));

        server
            .process_inbound(&room, "u1", "alice", &text_frame("silenced"))
            .await
            .unwrap();
        assert_eq!(texts_received(&other), 0);
        let notice = sender.received().pop().unwrap();
        assert_eq!(notice.message_type, MessageType::System);
        assert!(notice.content.contains("muted"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!server.moderator().is_user_muted("r1", "u1"));

        server
            .process_inbound(&room, "u1", "alice", &text_frame("back"))
            .await
            .unwrap();
        assert_eq!(texts_received(&other), 1);
    }

    #[tokio::test]
    async fn typing_updates_flag_without_rate_limit() {
        let server = server_with(1);
        let room = server.create_room("r1", "s1", "main").unwrap();
        let _sender = join(&server, "r1", "u1", "alice").await;
        let other = join(&server, "r1", "u2", "bob").await;

        // Typing frames are exempt from the rate limit.
        for _ in 0..5 {
            server
                .process_inbound(
                    &room,
                    "u1",
                    "alice",
                    r#"{"type":"typing","metadata":{"is_typing":true}}"#,
                )
                .await
                .unwrap();
        }
        assert!(room.get_user("u1").unwrap().is_typing);
        let typing_count = other
            .received()
            .iter()
            .filter(|m| m.message_type == MessageType::Typing)
            .count();
        assert_eq!(typing_count, 5);
    }

    #[tokio::test]
    async fn invalid_content_rejected_with_reason() {
        let mut config = ChatConfig::default();
        config.max_message_len = 5;
        let server = ChatServer::new(config);
        let room = server.create_room("r1", "s1", "main").unwrap();
        let sender = join(&server, "r1", "u1", "alice").await;
        let other = join(&server, "r1", "u2", "bob").await;

        server
            .process_inbound(&room, "u1", "alice", &text_frame("waaaay too long"))
            .await
            .unwrap();

        assert_eq!(texts_received(&other), 0);
        let rejection = sender.received().pop().unwrap();
        assert_eq!(rejection.message_type, MessageType::System);
        assert!(rejection.content.contains("maximum 5"));
    }

    #[tokio::test]
    async fn undecodable_frame_rejected_to_sender_only() {
        let server = server_with(10);
        let room = server.create_room("r1", "s1", "main").unwrap();
        let sender = join(&server, "r1", "u1", "alice").await;
        let other = join(&server, "r1", "u2", "bob").await;

        server
            .process_inbound(&room, "u1", "alice", "{not json")
            .await
            .unwrap();

        let rejection = sender.received().pop().unwrap();
        assert!(rejection.content.contains("Invalid message format"));
        assert!(!other
            .received()
            .iter()
            .any(|m| m.message_type == MessageType::System));
    }

    #[tokio::test]
    async fn identity_is_stamped_server_side() {
        let server = server_with(10);
        let room = server.create_room("r1", "s1", "main").unwrap();
        let _sender = join(&server, "r1", "u1", "alice").await;
        let other = join(&server, "r1", "u2", "bob").await;

        // A forged user_id in the payload is overwritten by the session's.
        server
            .process_inbound(
                &room,
                "u1",
                "alice",
                r#"{"type":"text","content":"hi","user_id":"u999","username":"mallory"}"#,
            )
            .await
            .unwrap();

        let msg = other
            .received()
            .into_iter()
            .find(|m| m.message_type == MessageType::Text)
            .unwrap();
        assert_eq!(msg.user_id, "u1");
        assert_eq!(msg.username, "alice");
        assert!(!msg.id.is_empty());
        assert_eq!(msg.room_id, "r1");
    }

    #[tokio::test]
    async fn moderation_respects_role_matrix() {
        let server = server_with(10);
        server.create_room("r1", "s1", "main").unwrap();

        let err = server
            .moderate("r1", Role::Viewer, ModAction::Mute, "u1", Some(Duration::from_secs(60)))
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let err = server
            .moderate("r1", Role::Moderator, ModAction::Ban, "u1", None)
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        server
            .moderate("r1", Role::Moderator, ModAction::Mute, "u1", Some(Duration::from_secs(60)))
            .unwrap();
        assert!(server.moderator().is_user_muted("r1", "u1"));

        server
            .moderate("r1", Role::Broadcaster, ModAction::Ban, "u2", None)
            .unwrap();
        assert!(server.moderator().is_user_banned("r1", "u2"));

        // Unknown room is refused outright.
        let err = server
            .moderate("ghost", Role::Admin, ModAction::Unban, "u1", None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Mute without a duration is malformed.
        let err = server
            .moderate("r1", Role::Admin, ModAction::Mute, "u3", None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn message_hook_observes_broadcasts() {
        let server = server_with(10);
        let room = server.create_room("r1", "s1", "main").unwrap();
        let _sender = join(&server, "r1", "u1", "alice").await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.set_on_message(Arc::new(move |msg| {
            let _ = tx.send(msg.content.clone());
        }));

        server
            .process_inbound(&room, "u1", "alice", &text_frame("observed"))
            .await
            .unwrap();
        let content = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content, "observed");
    }
}
