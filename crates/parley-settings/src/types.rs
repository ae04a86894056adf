//! Settings sections. Every struct is `#[serde(default)]` so a partial file
//! or a single env override only touches the keys it names.

use std::fmt;
use std::time::Duration;

use parley_core::backend::Framing;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

pub use parley_telemetry::{LogFormat, TelemetryConfig};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub rate_limit: RateLimitSettings,
    pub engine: EngineSettings,
    pub model: ModelSettings,
    pub tools: ToolSettings,
    pub store: StoreSettings,
    pub auth: AuthSettings,
    pub telemetry: TelemetryConfig,
}

/// HTTP listener and per-connection transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// WebSocket ping interval.
    pub heartbeat_interval_secs: u64,
    /// Drop a WebSocket that has not answered a ping for this long.
    pub heartbeat_timeout_secs: u64,
    /// Outbound queue depth per connection before it counts as slow.
    pub client_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            client_queue_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub quota: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            quota: 100,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Turn execution and session lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_rounds: u32,
    pub turn_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub max_output_tokens: u32,
    pub max_tool_output_bytes: usize,
    pub system_prompt: Option<String>,
    pub backlog_capacity: usize,
    pub idle_eviction_secs: u64,
    /// Sessions not updated for this long are purged. Zero disables purging.
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            turn_timeout_secs: 120,
            tool_timeout_secs: 30,
            max_output_tokens: 4096,
            max_tool_output_bytes: 32 * 1024,
            system_prompt: None,
            backlog_capacity: 1024,
            idle_eviction_secs: 15 * 60,
            session_ttl_secs: 30 * 24 * 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl EngineSettings {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        (self.session_ttl_secs > 0).then(|| Duration::from_secs(self.session_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub default_model: String,
    pub framing: Framing,
    /// No bytes for this long fails the generation.
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1/chat/completions".into(),
            api_key: None,
            default_model: "gpt-4o-mini".into(),
            framing: Framing::Sse,
            idle_timeout_secs: 90,
            connect_timeout_secs: 10,
        }
    }
}

impl ModelSettings {
    pub fn api_key(&self) -> Option<SecretString> {
        secret(&self.api_key)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &redacted(&self.api_key))
            .field("default_model", &self.default_model)
            .field("framing", &self.framing)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Endpoints and credentials for the built-in tools.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub search_url: String,
    #[serde(skip_serializing)]
    pub search_api_key: Option<String>,
    pub search_max_results: usize,
    pub image_url: String,
    #[serde(skip_serializing)]
    pub image_api_key: Option<String>,
    pub image_model: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            search_url: "https://api.search.brave.com/res/v1/web/search".into(),
            search_api_key: None,
            search_max_results: 5,
            image_url: "https://api.openai.com/v1/images/generations".into(),
            image_api_key: None,
            image_model: "gpt-image-1".into(),
        }
    }
}

impl ToolSettings {
    pub fn search_api_key(&self) -> Option<SecretString> {
        secret(&self.search_api_key)
    }

    pub fn image_api_key(&self) -> Option<SecretString> {
        secret(&self.image_api_key)
    }
}

impl fmt::Debug for ToolSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSettings")
            .field("search_url", &self.search_url)
            .field("search_api_key", &redacted(&self.search_api_key))
            .field("search_max_results", &self.search_max_results)
            .field("image_url", &self.image_url)
            .field("image_api_key", &redacted(&self.image_api_key))
            .field("image_model", &self.image_model)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite file. `:memory:` keeps everything in process.
    pub database_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: crate::loader::parley_dir()
                .join("parley.db")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// A bearer token accepted by the static authenticator.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub user_id: String,
    #[serde(skip_serializing)]
    pub token: String,
}

impl TokenEntry {
    pub fn token(&self) -> SecretString {
        SecretString::from(self.token.clone())
    }
}

impl fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEntry")
            .field("user_id", &self.user_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub tokens: Vec<TokenEntry>,
}

fn secret(value: &Option<String>) -> Option<SecretString> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|v| SecretString::from(v.to_owned()))
}

fn redacted(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "[REDACTED]")
}
