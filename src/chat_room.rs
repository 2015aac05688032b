// Chat rooms.
//
// A room owns its users and their connection handles; the two maps live
// under one lock so membership is atomic over both. Broadcast fan-out
// spawns one send task per connection and joins them all, so a slow
// connection delays only the broadcast call, never other senders' loops.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::message::{Message, Metadata};

// ---------------------------------------------------------------------------
// Role / User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Moderator,
    Admin,
    Broadcaster,
}

impl Default for Role {
    fn default() -> Self {
        Self::Viewer
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_typing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl User {
    pub fn new(id: &str, username: &str, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            username: username.to_string(),
            role,
            joined_at: now,
            last_activity: now,
            is_typing: false,
            metadata: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection seam
// ---------------------------------------------------------------------------

/// Transport handle the room sends into. Production wraps a WebSocket sink
/// behind a send-mutex; tests use channel-backed mocks.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// ChatRoom
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub id: String,
    pub stream_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub user_count: usize,
    pub is_closed: bool,
}

struct RoomInner {
    users: HashMap<String, User>,
    connections: HashMap<String, Arc<dyn Connection>>,
}

pub struct ChatRoom {
    pub id: String,
    pub stream_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    inner: RwLock<RoomInner>,
    closed: AtomicBool,
    /// Per-connection write deadline during fan-out.
    send_deadline: Duration,
}

impl std::fmt::Debug for ChatRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRoom")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl ChatRoom {
    pub fn new(id: &str, stream_id: &str, name: &str, send_deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            inner: RwLock::new(RoomInner {
                users: HashMap::new(),
                connections: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            send_deadline,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn user_count(&self) -> usize {
        self.inner.read().unwrap().users.len()
    }

    pub fn users(&self) -> Vec<User> {
        self.inner.read().unwrap().users.values().cloned().collect()
    }

    pub fn get_user(&self, user_id: &str) -> Option<User> {
        self.inner.read().unwrap().users.get(user_id).cloned()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            stream_id: self.stream_id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            user_count: self.user_count(),
            is_closed: self.is_closed(),
        }
    }

    // ── Membership ──────────────────────────────────────────────────────

    /// Add a user and their connection atomically, then announce the join.
    pub async fn add_user(&self, mut user: User, conn: Arc<dyn Connection>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::precondition(format!("room '{}' is closed", self.id)));
        }

        let user_count = {
            let mut inner = self.inner.write().unwrap();
            if inner.users.contains_key(&user.id) {
                return Err(Error::already_exists(format!(
                    "user '{}' is already in room '{}'",
                    user.id, self.id
                )));
            }
            let now = Utc::now();
            user.joined_at = now;
            user.last_activity = now;
            inner.connections.insert(user.id.clone(), conn);
            inner.users.insert(user.id.clone(), user.clone());
            inner.users.len()
        };

        info!(
            "room '{}': user '{}' joined ({user_count} present)",
            self.id, user.username
        );
        let join = Message::join(&self.id, &user.id, &user.username, user_count);
        self.fan_out(join).await;
        Ok(())
    }

    /// Remove a user, close their connection, announce the leave.
    pub async fn remove_user(&self, user_id: &str) -> Result<()> {
        let (user, conn, user_count) = {
            let mut inner = self.inner.write().unwrap();
            let user = inner.users.remove(user_id).ok_or_else(|| {
                Error::not_found(format!("user '{user_id}' is not in room '{}'", self.id))
            })?;
            let conn = inner.connections.remove(user_id);
            (user, conn, inner.users.len())
        };

        if let Some(conn) = conn {
            conn.close().await;
        }

        info!(
            "room '{}': user '{}' left ({user_count} remain)",
            self.id, user.username
        );
        let leave = Message::leave(&self.id, &user.id, &user.username, user_count);
        self.fan_out(leave).await;
        Ok(())
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Broadcast a message to every connection. The sender's activity clock
    /// is bumped and their typing flag cleared.
    pub async fn broadcast_message(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::precondition(format!("room '{}' is closed", self.id)));
        }

        {
            let mut inner = self.inner.write().unwrap();
            if let Some(sender) = inner.users.get_mut(&message.user_id) {
                sender.last_activity = Utc::now();
                sender.is_typing = false;
            }
        }

        self.fan_out(message).await;
        Ok(())
    }

    /// Deliver to one member only.
    pub async fn send_to_user(&self, user_id: &str, message: Message) -> Result<()> {
        let conn = {
            let inner = self.inner.read().unwrap();
            inner.connections.get(user_id).cloned()
        }
        .ok_or_else(|| {
            Error::not_found(format!("user '{user_id}' is not in room '{}'", self.id))
        })?;

        if let Err(err) = self.send_bounded(&conn, &message).await {
            warn!("room '{}': send to '{user_id}' failed: {err}", self.id);
        }
        Ok(())
    }

    /// Update a user's typing flag and announce it.
    pub async fn set_user_typing(&self, user_id: &str, is_typing: bool) -> Result<()> {
        let username = {
            let mut inner = self.inner.write().unwrap();
            let user = inner.users.get_mut(user_id).ok_or_else(|| {
                Error::not_found(format!("user '{user_id}' is not in room '{}'", self.id))
            })?;
            user.is_typing = is_typing;
            user.username.clone()
        };

        let typing = Message::typing(&self.id, user_id, &username, is_typing);
        self.fan_out(typing).await;
        Ok(())
    }

    pub fn update_user_role(&self, user_id: &str, role: Role) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let user = inner.users.get_mut(user_id).ok_or_else(|| {
            Error::not_found(format!("user '{user_id}' is not in room '{}'", self.id))
        })?;
        user.role = role;
        Ok(())
    }

    /// Close the room: idempotent. All connections are closed and both maps
    /// cleared before this returns.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connections: Vec<Arc<dyn Connection>> = {
            let mut inner = self.inner.write().unwrap();
            inner.users.clear();
            inner.connections.drain().map(|(_, c)| c).collect()
        };

        for conn in connections {
            conn.close().await;
        }
        info!("room '{}' closed", self.id);
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    /// One send task per connection; all joined before returning. Ordering
    /// across connections is unspecified, but each connection's own sends
    /// are serialized by its send-mutex.
    async fn fan_out(&self, message: Message) {
        let connections: Vec<(String, Arc<dyn Connection>)> = {
            let inner = self.inner.read().unwrap();
            inner
                .connections
                .iter()
                .map(|(id, c)| (id.clone(), Arc::clone(c)))
                .collect()
        };

        let deadline = self.send_deadline;
        let room_id = self.id.clone();
        let message = Arc::new(message);

        let tasks: Vec<_> = connections
            .into_iter()
            .map(|(user_id, conn)| {
                let message = Arc::clone(&message);
                let room_id = room_id.clone();
                tokio::spawn(async move {
                    let result =
                        tokio::time::timeout(deadline, conn.send(&message)).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!("room '{room_id}': send to '{user_id}' failed: {err}");
                        }
                        Err(_) => {
                            warn!("room '{room_id}': send to '{user_id}' timed out");
                        }
                    }
                })
            })
            .collect();

        for task in tasks {
            let _ = task.await;
        }
    }

    async fn send_bounded(&self, conn: &Arc<dyn Connection>, message: &Message) -> Result<()> {
        tokio::time::timeout(self.send_deadline, conn.send(message))
            .await
            .map_err(|_| Error::transient("send deadline exceeded"))?
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
