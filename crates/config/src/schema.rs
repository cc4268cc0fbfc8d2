//! Config schema types (server, session, commands, rate limiting, webhook,
//! store, plugins).
//!
//! Every section is `#[serde(default)]` so a partial file only overrides
//! what it names.

use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub commands: CommandsConfig,
    pub rate_limit: RateLimitConfig,
    pub webhook: WebhookConfig,
    pub store: StoreConfig,
    pub plugins: PluginsConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

/// Chat-network session lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket URL of the chat-network sidecar.
    pub sidecar_url: String,
    /// Delay before the first reconnection attempt; doubled on each retry.
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for the doubled delay (jitter is added on top).
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed reconnections tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// How often a fresh pairing QR is requested while waiting for a scan.
    pub qr_refresh_interval_ms: u64,
    /// Liveness probe interval while connected.
    pub health_check_interval_ms: u64,
    /// A probe that takes longer than this counts as failed.
    pub health_check_timeout_ms: u64,
    /// Timeout for a single request/response exchange with the sidecar.
    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sidecar_url: "ws://127.0.0.1:9876".into(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            max_reconnect_attempts: 10,
            qr_refresh_interval_ms: 30_000,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
        }
    }
}

/// Command parsing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Character that marks a message as a command (`!ping`).
    pub prefix: char,
    /// Run the pipeline for messages sent by the logged-in account itself.
    pub respond_to_self: bool,
    /// Built-in commands that should not be registered.
    pub disabled: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            prefix: '!',
            respond_to_self: false,
            disabled: Vec::new(),
        }
    }
}

/// Per-conversation fixed-window rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    /// Messages accepted per window. `0` disables limiting.
    pub max_requests: u32,
    /// How often stale windows are purged from memory and the store.
    pub sweep_interval_ms: u64,
    /// Tell the sender when a message is dropped by the limiter.
    pub notify: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 20,
            sweep_interval_ms: 3_600_000,
            notify: false,
        }
    }
}

/// Inbound webhook authentication and outbound broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared HMAC secret. The inbound webhook is disabled while empty.
    #[serde(serialize_with = "serialize_secret")]
    pub secret: Secret<String>,
    /// Maximum accepted age (and future skew) of `x-webhook-timestamp`.
    pub timeout_ms: u64,
    /// Reject requests that carry no timestamp header.
    pub require_timestamp: bool,
    /// Lifetime of outbound envelope tokens.
    pub envelope_ttl_ms: u64,
    /// URLs that receive signed lifecycle broadcasts.
    pub subscribers: Vec<String>,
    /// Per-subscriber HTTP timeout.
    pub delivery_timeout_ms: u64,
}

impl WebhookConfig {
    /// Whether a non-empty secret is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.secret.expose_secret().is_empty()
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: Secret::new(String::new()),
            timeout_ms: 300_000,
            require_timestamp: false,
            envelope_ttl_ms: 300_000,
            subscribers: Vec::new(),
            delivery_timeout_ms: 10_000,
        }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Persistence options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL. Defaults to `sqlite://<data_dir>/parley.db`.
    pub database_url: Option<String>,
}

/// Bundled plugin options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub command_logger: CommandLoggerConfig,
    pub auto_reply: AutoReplyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandLoggerConfig {
    pub enabled: bool,
    /// JSONL destination. Defaults to `<data_dir>/logs/commands.log`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoReplyConfig {
    pub enabled: bool,
    pub rules: Vec<AutoReplyRule>,
}

/// Reply with `reply` whenever a message contains `keyword` (case-insensitive).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoReplyRule {
    pub keyword: String,
    pub reply: String,
    /// Only answer in one-to-one chats.
    #[serde(default)]
    pub direct_only: bool,
}
