//! Turn results: the typed failure descriptor and stream events.

use crate::providers::ProviderError;
use serde::Serialize;
use std::fmt;

/// Broad class of a failed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No upstream credential configured; no call was attempted.
    Configuration,
    /// Transport error, non-2xx status, malformed payload or timeout.
    Upstream,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::Upstream => "upstream",
        }
    }
}

/// Why a turn produced no model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TurnFailure {
    pub fn missing_credential(provider: &str) -> Self {
        Self {
            kind: FailureKind::Configuration,
            message: format!("{provider} API key not set"),
        }
    }

    /// Human-readable text shown in place of a model reply.
    pub fn reply_text(&self) -> String {
        match self.kind {
            FailureKind::Configuration => "⚠️ Server missing OPENAI_API_KEY.".to_string(),
            FailureKind::Upstream => format!("⚠️ Upstream error: {}", self.message),
        }
    }
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl From<ProviderError> for TurnFailure {
    fn from(err: ProviderError) -> Self {
        let kind = if err.is_missing_credential() {
            FailureKind::Configuration
        } else {
            FailureKind::Upstream
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// One event of a streamed turn, in emission order:
/// `Heartbeat`, any number of `Fragment`s, at most one `Failure`, then `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// No-op frame sent before any upstream activity.
    Heartbeat,
    /// A piece of generated text, verbatim. May be empty.
    Fragment(String),
    /// The turn failed; fragments already sent stay valid.
    Failure(TurnFailure),
    /// Terminal marker, emitted exactly once.
    End,
}
