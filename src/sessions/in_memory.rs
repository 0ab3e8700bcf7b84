//! In-memory session store implementation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use super::traits::{SessionStore, Turn};

/// Bounds on how many sessions stay resident and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum resident sessions; the least recently active one is evicted
    /// to make room. `0` disables the cap.
    pub max_sessions: usize,
    /// Sessions idle for longer than this read as empty and are pruned.
    pub idle_ttl: Option<Duration>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            idle_ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl SessionLimits {
    pub fn unbounded() -> Self {
        Self {
            max_sessions: 0,
            idle_ttl: None,
        }
    }
}

struct SessionEntry {
    turns: Vec<Turn>,
    last_activity: DateTime<Utc>,
}

/// An in-memory session store backed by a mutex-protected hash map.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    limits: SessionLimits,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_limits(SessionLimits::default())
    }

    pub fn with_limits(limits: SessionLimits) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
        }
    }

    fn is_expired(&self, entry: &SessionEntry, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.limits.idle_ttl else {
            return false;
        };
        now.signed_duration_since(entry.last_activity)
            .to_std()
            .map_or(false, |idle| idle > ttl)
    }

    /// Evict least-recently-active sessions until one more fits.
    fn make_room(&self, sessions: &mut HashMap<String, SessionEntry>) {
        if self.limits.max_sessions == 0 {
            return;
        }
        while sessions.len() >= self.limits.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_activity)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
            tracing::debug!(session_id = %oldest, "evicted least recently active session");
        }
    }

    fn get_or_create_at(&self, session_id: &str, now: DateTime<Utc>) -> Vec<Turn> {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            if self.is_expired(entry, now) {
                entry.turns.clear();
            }
            entry.last_activity = now;
            return entry.turns.clone();
        }

        self.make_room(&mut sessions);
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                turns: Vec::new(),
                last_activity: now,
            },
        );
        Vec::new()
    }

    fn replace_at(&self, session_id: &str, turns: Vec<Turn>, now: DateTime<Utc>) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.turns = turns;
            entry.last_activity = now;
            return;
        }

        self.make_room(&mut sessions);
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                turns,
                last_activity: now,
            },
        );
    }

    fn prune_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| !self.is_expired(entry, now));
        before - sessions.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get_or_create(&self, session_id: &str) -> Vec<Turn> {
        self.get_or_create_at(session_id, Utc::now())
    }

    fn replace(&self, session_id: &str, turns: Vec<Turn>) {
        self.replace_at(session_id, turns, Utc::now());
    }

    fn reset(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn prune_expired(&self) -> usize {
        self.prune_expired_at(Utc::now())
    }
}
