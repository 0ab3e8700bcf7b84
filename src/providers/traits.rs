//! Upstream completion provider interface.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

pub use crate::sessions::{Role, Turn};

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Budget for each wait on the upstream service.
    pub timeout: Duration,
}

/// Errors raised while talking to the upstream completion service.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API key not set")]
    MissingCredential { provider: String },

    #[error("{provider} API error ({status}): {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no response from {0}")]
    Empty(String),
}

impl ProviderError {
    pub fn is_missing_credential(&self) -> bool {
        matches!(self, ProviderError::MissingCredential { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::Transport("upstream request timed out".to_string());
        }
        if err.is_decode() {
            return ProviderError::Malformed(super::sanitize_api_error(&err.to_string()));
        }
        ProviderError::Transport(super::sanitize_api_error(&err.to_string()))
    }
}

/// Lazy, finite, non-restartable sequence of generated text fragments.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// A remote model that turns a prompt context into generated text.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Return the whole reply in one piece.
    async fn chat_with_history(
        &self,
        messages: &[Turn],
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    /// Start an incremental reply. Fragments are yielded as the upstream
    /// produces them; an empty string is a valid fragment.
    async fn stream_chat_with_history(
        &self,
        messages: &[Turn],
        options: &CompletionOptions,
    ) -> Result<FragmentStream, ProviderError>;

    /// Whether a credential is configured. Without one no call is attempted.
    fn has_credential(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}
