//! Provider subsystem for upstream completion backends.
//!
//! Every provider implements the [`Provider`] trait defined in [`traits`] and is
//! created by [`create_provider`] from its canonical string key. All supported
//! backends speak the OpenAI-compatible chat completions API, so they share
//! [`compatible::OpenAiCompatibleProvider`] and differ only by base URL and
//! credential lookup.

pub mod compatible;
pub mod traits;

#[allow(unused_imports)]
pub use traits::{CompletionOptions, FragmentStream, Provider, ProviderError, Role, Turn};

use compatible::OpenAiCompatibleProvider;
use std::sync::Arc;

const MAX_API_ERROR_CHARS: usize = 200;

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub known secret-like token prefixes from provider error strings.
///
/// Redacts tokens with prefixes like `sk-`, `gsk_`, `ghp_` and `github_pat_`.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [&str; 5] = ["sk-", "gsk_", "ghp_", "gho_", "github_pat_"];

    let mut scrubbed = input.to_string();

    for prefix in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            if end == content_start {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize API error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

/// Build a sanitized provider error from a failed HTTP response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    ProviderError::Api {
        provider: provider.to_string(),
        status,
        body: sanitize_api_error(&body),
    }
}

/// Information about a supported provider for display purposes.
pub struct ProviderInfo {
    /// Canonical name used in config (e.g. `"openai"`)
    pub name: &'static str,
    /// Human-readable display name
    pub display_name: &'static str,
    /// Default API base URL
    pub base_url: &'static str,
    /// Environment variables consulted for the credential, in order
    pub key_env: &'static [&'static str],
}

/// Return the list of all known providers.
pub fn list_providers() -> Vec<ProviderInfo> {
    vec![
        ProviderInfo {
            name: "openai",
            display_name: "OpenAI",
            base_url: "https://api.openai.com/v1",
            key_env: &["OPENAI_API_KEY"],
        },
        ProviderInfo {
            name: "openrouter",
            display_name: "OpenRouter",
            base_url: "https://openrouter.ai/api/v1",
            key_env: &["OPENROUTER_API_KEY"],
        },
        ProviderInfo {
            name: "groq",
            display_name: "Groq",
            base_url: "https://api.groq.com/openai/v1",
            key_env: &["GROQ_API_KEY"],
        },
    ]
}

/// Resolve API key for a provider from config and environment variables.
fn resolve_provider_credential(name: &str, credential_override: Option<&str>) -> Option<String> {
    if let Some(raw_override) = credential_override {
        let trimmed_override = raw_override.trim();
        if !trimmed_override.is_empty() {
            return Some(trimmed_override.to_owned());
        }
    }

    let provider_env_candidates: &[&str] = list_providers()
        .into_iter()
        .find(|p| p.name == name)
        .map(|p| p.key_env)
        .unwrap_or_default();

    for env_var in provider_env_candidates.iter().chain(["CLARITY_API_KEY", "API_KEY"].iter()) {
        if let Ok(value) = std::env::var(env_var) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    None
}

/// Factory: create the right provider from config with optional custom base URL.
///
/// `custom:<URL>` selects any OpenAI-compatible endpoint. A missing credential
/// is not an error here; the provider reports it through
/// [`Provider::has_credential`] and the orchestrator short-circuits.
pub fn create_provider(
    name: &str,
    api_key: Option<&str>,
    api_url: Option<&str>,
) -> anyhow::Result<Arc<dyn Provider>> {
    let key = resolve_provider_credential(name, api_key);

    if let Some(custom_url) = name.strip_prefix("custom:") {
        if custom_url.trim().is_empty() {
            anyhow::bail!("custom provider requires a URL, e.g. custom:http://localhost:8000/v1");
        }
        return Ok(Arc::new(OpenAiCompatibleProvider::new(
            "custom",
            api_url.unwrap_or(custom_url),
            key.as_deref(),
        )));
    }

    let Some(info) = list_providers().into_iter().find(|p| p.name == name) else {
        anyhow::bail!(
            "Unknown provider: {name}. Supported: openai, openrouter, groq, custom:<URL>."
        );
    };

    Ok(Arc::new(OpenAiCompatibleProvider::new(
        info.display_name,
        api_url.unwrap_or(info.base_url),
        key.as_deref(),
    )))
}
