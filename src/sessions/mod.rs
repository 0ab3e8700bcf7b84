//! Session management: per-session conversation history and turn locks.

pub mod in_memory;
pub mod lock;
pub mod traits;
pub mod window;

use std::sync::Arc;

pub use in_memory::{InMemorySessionStore, SessionLimits};
pub use lock::{SessionLockMap, SessionPermit};
pub use traits::{Role, SessionStore, Turn};
pub use window::{push_windowed, truncate_to_window};

/// Session id used when a request does not name one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Create a default in-memory session store.
pub fn create_session_store(limits: SessionLimits) -> Arc<dyn SessionStore> {
    Arc::new(InMemorySessionStore::with_limits(limits))
}
