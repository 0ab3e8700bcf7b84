//! Session storage traits and types for conversation history.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a single turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exchange unit. Turns are never edited, only appended or evicted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Volatile storage for per-session turn sequences.
///
/// Sessions are created implicitly on first access; an empty session and an
/// unknown session are indistinguishable to callers. None of the operations
/// can fail.
pub trait SessionStore: Send + Sync {
    /// Return the stored turns for `session_id`, registering an empty
    /// session if the id is unknown.
    fn get_or_create(&self, session_id: &str) -> Vec<Turn>;

    /// Atomically overwrite the stored turns for `session_id`.
    fn replace(&self, session_id: &str, turns: Vec<Turn>);

    /// Drop all turns for `session_id`. Unknown ids are a no-op.
    fn reset(&self, session_id: &str);

    /// Number of sessions currently resident.
    fn session_count(&self) -> usize;

    /// Evict sessions idle for longer than the configured TTL.
    /// Returns how many were removed.
    fn prune_expired(&self) -> usize {
        0
    }
}
