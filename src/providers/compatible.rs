//! Generic OpenAI-compatible provider.
//! Most LLM APIs follow the same `/v1/chat/completions` format.
//! This module provides a single implementation that works for all of them.

use crate::providers::traits::{
    CompletionOptions, FragmentStream, Provider, ProviderError, Turn,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct OpenAiCompatibleProvider {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    client: Client,
}

/// Longest SSE line accepted before the body is treated as malformed.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            // No overall timeout here: streamed bodies may outlive any fixed
            // budget. Callers bound each wait instead.
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Build the full URL for chat completions, detecting if base_url already includes the path.
    fn chat_completions_url(&self) -> String {
        let has_full_endpoint = reqwest::Url::parse(&self.base_url)
            .map(|url| {
                url.path()
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            })
            .unwrap_or_else(|_| {
                self.base_url
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            });

        if has_full_endpoint {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn require_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential {
                provider: self.name.clone(),
            })
    }

    async fn send(
        &self,
        messages: &[Turn],
        options: &CompletionOptions,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.require_key()?;

        let request = ChatRequest {
            model: &options.model,
            messages: messages
                .iter()
                .map(|m| Message {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: Some(stream),
        };

        let mut builder = self.client.post(self.chat_completions_url()).json(&request);
        if !stream {
            builder = builder.timeout(options.timeout);
        }

        let response = builder.bearer_auth(api_key).send().await?;
        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ══════════════════════════════════════════════════════════
// SSE streaming types for OpenAI-compatible chat completions
// ══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct StreamChatResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    /// Set when the upstream aborts a stream with an error frame.
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Works on raw bytes so a multi-byte character split across network
/// chunks is only decoded once the whole line has arrived.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the `data:` payloads of every line it
    /// completed. `[DONE]` and blank payloads are dropped.
    ///
    /// Fails once an unterminated line grows past [`MAX_SSE_LINE_BYTES`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line[..line.len() - 1]) {
                payloads.push(payload);
            }
        }

        if self.buf.len() > MAX_SSE_LINE_BYTES {
            self.buf.clear();
            return Err(ProviderError::Malformed(format!(
                "stream line exceeds {MAX_SSE_LINE_BYTES} bytes"
            )));
        }
        Ok(payloads)
    }

    /// Flush a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Vec<String> {
        let line = std::mem::take(&mut self.buf);
        data_payload(&line).into_iter().collect()
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim_end_matches('\r').strip_prefix("data:")?.trim();
    // Lines that don't start with "data:" are ignored (comments, event names, etc.)
    if data.is_empty() || data == "[DONE]" {
        None
    } else {
        Some(data.to_string())
    }
}

/// Turn one `data:` payload into the content fragments it carries.
///
/// Error frames and payloads that are not a completion chunk are failures.
pub fn fragments_from_payload(provider: &str, payload: &str) -> Result<Vec<String>, ProviderError> {
    let chunk: StreamChatResponse = serde_json::from_str(payload).map_err(|e| {
        ProviderError::Malformed(format!("{provider} sent an unreadable stream payload: {e}"))
    })?;

    if let Some(error) = chunk.error {
        let message = match &error {
            serde_json::Value::String(text) => text.clone(),
            other => other
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map_or_else(|| other.to_string(), ToString::to_string),
        };
        return Err(ProviderError::Malformed(format!(
            "{provider} stream error: {}",
            super::sanitize_api_error(&message)
        )));
    }

    Ok(chunk
        .choices
        .into_iter()
        .filter_map(|choice| {
            if let Some(reason) = choice.finish_reason.as_deref() {
                tracing::trace!(provider, finish_reason = reason, "stream choice finished");
            }
            choice.delta.content
        })
        .collect())
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn chat_with_history(
        &self,
        messages: &[Turn],
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let response = self.send(messages, options, false).await?;

        let chat_response: ApiChatResponse = response.json().await?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| ProviderError::Empty(self.name.clone()))
    }

    async fn stream_chat_with_history(
        &self,
        messages: &[Turn],
        options: &CompletionOptions,
    ) -> Result<FragmentStream, ProviderError> {
        let response = self.send(messages, options, true).await?;
        let provider = self.name.clone();

        let fragments = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            let mut byte_stream = response.bytes_stream();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(ProviderError::from(e));
                        return;
                    }
                };

                let payloads = match decoder.push(&bytes) {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                for payload in payloads {
                    match fragments_from_payload(&provider, &payload) {
                        Ok(contents) => {
                            for content in contents {
                                yield Ok(content);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            // Process any remaining SSE data
            for payload in decoder.finish() {
                match fragments_from_payload(&provider, &payload) {
                    Ok(contents) => {
                        for content in contents {
                            yield Ok(content);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(fragments))
    }

    fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
