use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

struct Entry {
    count: u32,
    reset_time: Instant,
}

/// Fixed-window per-key rate limiter.
///
/// The first `allow` in a window starts it; once `max_count` calls have been
/// admitted, further calls are denied until the window resets.
pub struct RateLimiter {
    max_count: u32,
    window: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl RateLimiter {
    pub fn new(max_count: u32, window: Duration) -> Self {
        Self {
            max_count,
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or deny one event for `key`.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();

        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        count: 1,
                        reset_time: now + self.window,
                    },
                );
                true
            }
            Some(entry) if now > entry.reset_time => {
                entry.count = 1;
                entry.reset_time = now + self.window;
                true
            }
            Some(entry) if entry.count < self.max_count => {
                entry.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Forget a key's window entirely.
    pub fn reset(&self, key: &str) {
        self.entries.write().unwrap().remove(key);
    }

    /// Drop entries whose window has passed; returns the number removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| now <= e.reset_time);
        before - entries.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

/// Sweep expired windows periodically until cancelled.
pub fn spawn_rate_limit_sweeper(
    limiter: Arc<RateLimiter>,
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
                    let removed = limiter.cleanup();
                    if removed > 0 {
                        debug!("rate limiter: {removed} expired window(s) swept");
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
