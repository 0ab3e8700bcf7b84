//! Per-session concurrency control.
//!
//! Only one turn runs per session at a time. A second request for the same
//! session waits until the first one (including its stream finalize) has
//! released the lock; different sessions never block each other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one turn; releases the session on drop.
pub type SessionPermit = OwnedMutexGuard<()>;

/// Manages per-session run locks.
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    prune_threshold: usize,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::with_prune_threshold(1024)
    }

    /// Idle lock entries are dropped whenever the table grows past
    /// `prune_threshold` entries.
    pub fn with_prune_threshold(prune_threshold: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            prune_threshold: prune_threshold.max(1),
        }
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: &str) -> SessionPermit {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() >= self.prune_threshold && !locks.contains_key(session_id) {
                Self::prune_locked(&mut locks);
            }
            Arc::clone(
                locks
                    .entry(session_id.to_owned())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        lock.lock_owned().await
    }

    /// Number of tracked sessions.
    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Remove locks nobody holds or waits on.
    pub fn prune_idle(&self) {
        Self::prune_locked(&mut self.locks.lock());
    }

    fn prune_locked(locks: &mut HashMap<String, Arc<AsyncMutex<()>>>) {
        // the map's own handle is the only reference left for idle entries
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
