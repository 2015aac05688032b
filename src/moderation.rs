use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chat_room::Role;

// ---------------------------------------------------------------------------
// Actions and role authorization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModAction {
    Ban,
    Unban,
    Mute,
    Unmute,
}

/// Broadcasters and admins may do everything; moderators everything except
/// permanent bans; viewers nothing.
pub fn can_moderate(role: Role, action: ModAction) -> bool {
    match role {
        Role::Broadcaster | Role::Admin => true,
        Role::Moderator => !matches!(action, ModAction::Ban),
        Role::Viewer => false,
    }
}

// ---------------------------------------------------------------------------
// Moderator
// ---------------------------------------------------------------------------

struct ModerationState {
    banned: HashMap<String, HashSet<String>>,
    muted: HashMap<String, HashMap<String, Instant>>,
}

/// In-memory bans and timed mutes, scoped per room.
///
/// Expired mutes are logically absent: reads delete them lazily and a
/// periodic sweep drops the rest.
pub struct Moderator {
    state: RwLock<ModerationState>,
}

impl Moderator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ModerationState {
                banned: HashMap::new(),
                muted: HashMap::new(),
            }),
        }
    }

    // ── Bans ────────────────────────────────────────────────────────────

    pub fn ban_user(&self, room_id: &str, user_id: &str) {
        let mut state = self.state.write().unwrap();
        state
            .banned
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        info!("room '{room_id}': user '{user_id}' banned");
    }

    pub fn unban_user(&self, room_id: &str, user_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(set) = state.banned.get_mut(room_id) {
            set.remove(user_id);
            if set.is_empty() {
                state.banned.remove(room_id);
            }
        }
    }

    pub fn is_user_banned(&self, room_id: &str, user_id: &str) -> bool {
        let state = self.state.read().unwrap();
        state
            .banned
            .get(room_id)
            .is_some_and(|set| set.contains(user_id))
    }

    pub fn banned_users(&self, room_id: &str) -> Vec<String> {
        let state = self.state.read().unwrap();
        state
            .banned
            .get(room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Mutes ───────────────────────────────────────────────────────────

    pub fn mute_user(&self, room_id: &str, user_id: &str, duration: Duration) {
        let mut state = self.state.write().unwrap();
        state
            .muted
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string(), Instant::now() + duration);
        info!(
            "room '{room_id}': user '{user_id}' muted for {}s",
            duration.as_secs()
        );
    }

    pub fn unmute_user(&self, room_id: &str, user_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(map) = state.muted.get_mut(room_id) {
            map.remove(user_id);
            if map.is_empty() {
                state.muted.remove(room_id);
            }
        }
    }

    /// Returns false once the mute has expired, deleting the entry.
    pub fn is_user_muted(&self, room_id: &str, user_id: &str) -> bool {
        let expired = {
            let state = self.state.read().unwrap();
            match state.muted.get(room_id).and_then(|m| m.get(user_id)) {
                Some(expires_at) if *expires_at > Instant::now() => return true,
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.unmute_user(room_id, user_id);
        }
        false
    }

    /// Currently muted users, filtered to unexpired entries.
    pub fn muted_users(&self, room_id: &str) -> Vec<String> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        state
            .muted
            .get(room_id)
            .map(|map| {
                map.iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every expired mute; returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        let mut removed = 0;
        state.muted.retain(|_, map| {
            let before = map.len();
            map.retain(|_, expires_at| *expires_at > now);
            removed += before - map.len();
            !map.is_empty()
        });
        removed
    }
}

impl Default for Moderator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sweep expired mutes periodically until cancelled.
pub fn spawn_moderation_sweeper(
    moderator: Arc<Moderator>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = moderator.cleanup_expired();
                    if removed > 0 {
                        debug!("moderation: {removed} expired mute(s) swept");
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
