use crate::agent::{TurnSettings, DEFAULT_SYSTEM_PROMPT};
use crate::providers::CompletionOptions;
use crate::sessions::SessionLimits;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

// ── Top-level config ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path the config was read from, if any (computed, not serialized)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

// ── Provider ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider key: `openai`, `openrouter`, `groq` or `custom:<URL>`
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL override for the chat completions endpoint
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Budget for each upstream wait
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Replaces the built-in coaching instruction when set
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_provider_name() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f64 {
    0.4
}

fn default_max_tokens() -> u32 {
    256
}

fn default_timeout_secs() -> u64 {
    20
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            api_key: None,
            api_url: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            system_prompt: None,
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum stored turns per session
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Resident session cap; least recently active is evicted. 0 = uncapped
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle time after which a session reads as empty. 0 = never expires
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

fn default_history_window() -> usize {
    6
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_idle_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            max_sessions: default_max_sessions(),
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Allowed CORS origin; `*` allows any origin without credentials
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_allowed_origin() -> String {
    "*".into()
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            allowed_origin: default_allowed_origin(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Config file location ─────────────────────────────────────────

fn default_config_dir() -> Option<PathBuf> {
    UserDirs::new().map(|u| u.home_dir().join(".clarity"))
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw.trim()).into_owned())
}

/// Where to read config from, and whether the file must exist.
///
/// An explicit path or `CLARITY_CONFIG` must point at a file; the default
/// `~/.clarity/config.toml` is optional.
fn resolve_config_path(explicit: Option<&str>, env_path: Option<String>) -> Option<(PathBuf, bool)> {
    let chosen = explicit
        .map(str::to_string)
        .or(env_path)
        .filter(|raw| !raw.trim().is_empty());
    if let Some(raw) = chosen {
        return Some((expand_path(&raw), true));
    }
    default_config_dir().map(|dir| (dir.join("config.toml"), false))
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = raw, "ignoring unparsable environment override");
            None
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Config {
    /// Load defaults, then the TOML file if any, then environment overrides.
    pub async fn load(explicit: Option<&str>) -> Result<Self> {
        let resolved = resolve_config_path(explicit, std::env::var("CLARITY_CONFIG").ok());

        let mut config = match resolved {
            Some((path, _)) if path.exists() => Self::read_file(&path).await?,
            Some((path, true)) => {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            _ => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config
                .config_path
                .as_deref()
                .map_or_else(|| "<defaults>".to_string(), |p| p.display().to_string()),
            provider = %config.provider.name,
            model = %config.provider.model,
            "Config loaded"
        );
        Ok(config)
    }

    async fn read_file(path: &Path) -> Result<Self> {
        // Warn if config file is world-readable (may contain API keys)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(path).await {
                if meta.permissions().mode() & 0o004 != 0 {
                    tracing::warn!(
                        "Config file {:?} is world-readable (mode {:o}). \
                         Consider restricting with: chmod 600 {:?}",
                        path,
                        meta.permissions().mode() & 0o777,
                        path,
                    );
                }
            }
        }

        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid config TOML")
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Gateway
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.allowed_origin.trim().is_empty() {
            anyhow::bail!("gateway.allowed_origin must not be empty (use \"*\" for any)");
        }
        if self.gateway.max_body_bytes == 0 {
            anyhow::bail!("gateway.max_body_bytes must be greater than 0");
        }

        // Provider
        if self.provider.name.trim().is_empty() {
            anyhow::bail!("provider.name must not be empty");
        }
        if self.provider.model.trim().is_empty() {
            anyhow::bail!("provider.model must not be empty");
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            anyhow::bail!(
                "provider.temperature must be between 0.0 and 2.0 (got {})",
                self.provider.temperature
            );
        }
        if self.provider.max_tokens == 0 {
            anyhow::bail!("provider.max_tokens must be greater than 0");
        }
        if self.provider.timeout_secs == 0 {
            anyhow::bail!("provider.timeout_secs must be greater than 0");
        }

        // Sessions
        if self.session.history_window == 0 {
            anyhow::bail!("session.history_window must be greater than 0");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source. Empty values are ignored;
    /// for paired names the first one set wins.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        // Credential: OPENAI_API_KEY, CLARITY_API_KEY or API_KEY
        if let Some(key) = get("OPENAI_API_KEY")
            .or_else(|| get("CLARITY_API_KEY"))
            .or_else(|| get("API_KEY"))
        {
            self.provider.api_key = Some(key.trim().to_string());
        }

        if let Some(model) = get("OPENAI_MODEL").or_else(|| get("CLARITY_MODEL")) {
            self.provider.model = model.trim().to_string();
        }

        if let Some(url) = get("OPENAI_BASE_URL").or_else(|| get("CLARITY_API_URL")) {
            self.provider.api_url = Some(url.trim().to_string());
        }

        if let Some(origin) = get("FRONTEND_ORIGIN") {
            self.gateway.allowed_origin = origin.trim().to_string();
        }

        if let Some(window) = get("CLARITY_HISTORY_WINDOW")
            .and_then(|raw| parse_env("CLARITY_HISTORY_WINDOW", &raw))
        {
            self.session.history_window = window;
        }

        if let Some(temperature) =
            get("CLARITY_TEMPERATURE").and_then(|raw| parse_env("CLARITY_TEMPERATURE", &raw))
        {
            self.provider.temperature = temperature;
        }

        if let Some(max_tokens) =
            get("CLARITY_MAX_TOKENS").and_then(|raw| parse_env("CLARITY_MAX_TOKENS", &raw))
        {
            self.provider.max_tokens = max_tokens;
        }

        if let Some(secs) = get("CLARITY_REQUEST_TIMEOUT_SECS")
            .and_then(|raw| parse_env("CLARITY_REQUEST_TIMEOUT_SECS", &raw))
        {
            self.provider.timeout_secs = secs;
        }

        if let Some(max) =
            get("CLARITY_MAX_SESSIONS").and_then(|raw| parse_env("CLARITY_MAX_SESSIONS", &raw))
        {
            self.session.max_sessions = max;
        }

        if let Some(secs) = get("CLARITY_SESSION_IDLE_SECS")
            .and_then(|raw| parse_env("CLARITY_SESSION_IDLE_SECS", &raw))
        {
            self.session.idle_ttl_secs = secs;
        }

        // Gateway port: CLARITY_GATEWAY_PORT or PORT
        if let Some(raw) = get("CLARITY_GATEWAY_PORT").or_else(|| get("PORT")) {
            if let Some(port) = parse_env("PORT", &raw) {
                self.gateway.port = port;
            }
        }

        // Gateway host: CLARITY_GATEWAY_HOST or HOST
        if let Some(host) = get("CLARITY_GATEWAY_HOST").or_else(|| get("HOST")) {
            self.gateway.host = host.trim().to_string();
        }
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            window: self.session.history_window,
            system_prompt: self
                .provider
                .system_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            completion: CompletionOptions {
                model: self.provider.model.clone(),
                temperature: self.provider.temperature,
                max_tokens: self.provider.max_tokens,
                timeout: Duration::from_secs(self.provider.timeout_secs),
            },
        }
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_sessions: self.session.max_sessions,
            idle_ttl: (self.session.idle_ttl_secs > 0)
                .then(|| Duration::from_secs(self.session.idle_ttl_secs)),
        }
    }

    /// Credential for display: first four characters, rest masked.
    pub fn masked_api_key(&self) -> Option<String> {
        self.provider.api_key.as_deref().map(|key| {
            let visible: String = key.chars().take(4).collect();
            format!("{visible}****")
        })
    }
}
