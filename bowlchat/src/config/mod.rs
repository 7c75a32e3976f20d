//! Configuration system for the `BowlChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/bowlchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use bowlchat_proto::descriptor::{ChannelLayout, DEFAULT_PRIVATE_PREFIX, DEFAULT_ROOM_CHANNEL};

use crate::api::Credential;
use crate::backoff::{Backoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::controller::{ControllerOptions, DEFAULT_EVENT_CAPACITY, DEFAULT_HEALTH_CHECK};
use crate::transport::ws::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_BUFFER, WsConnector};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting required to reach the backend is not set anywhere.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    channels: ChannelsFileConfig,
    reconnect: ReconnectFileConfig,
    transport: TransportFileConfig,
    ui: UiFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_url: Option<String>,
    session_token: Option<String>,
    api_key: Option<String>,
}

/// `[channels]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChannelsFileConfig {
    room: Option<String>,
    private_prefix: Option<String>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    health_check_secs: Option<u64>,
}

/// `[transport]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    connect_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnection tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the retry delay.
    pub max_delay: Duration,
    /// Health check period; `None` disables the watchdog.
    pub health_check: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            health_check: Some(DEFAULT_HEALTH_CHECK),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Base URL of the backend REST API.
    pub api_url: Option<String>,
    /// Session token, sent as a bearer token.
    pub session_token: Option<String>,
    /// API key, used when no session token is set.
    pub api_key: Option<String>,

    // -- Channels --
    /// Shared room channel name.
    pub room_channel: String,
    /// Prefix of per-identity private channels.
    pub private_prefix: String,

    // -- Reconnect --
    /// Retry and watchdog settings.
    pub reconnect: ReconnectConfig,

    // -- Transport --
    /// Timeout for dialing the broker and completing the handshake.
    pub connect_timeout: Duration,
    /// Capacity of each session's event channel.
    pub event_buffer: usize,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            session_token: None,
            api_key: None,
            room_channel: DEFAULT_ROOM_CHANNEL.to_string(),
            private_prefix: DEFAULT_PRIVATE_PREFIX.to_string(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/bowlchat/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// CLI args over compiled defaults, ignoring any config file.
    #[must_use]
    pub fn load_defaults(cli: &CliArgs) -> Self {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        let base_delay = file
            .reconnect
            .base_delay_ms
            .map_or(defaults.reconnect.base_delay, Duration::from_millis);
        let max_delay = file
            .reconnect
            .max_delay_ms
            .map_or(defaults.reconnect.max_delay, Duration::from_millis);
        let health_check = match file.reconnect.health_check_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.reconnect.health_check,
        };

        Self {
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            session_token: cli
                .session_token
                .clone()
                .or_else(|| file.server.session_token.clone()),
            api_key: cli.api_key.clone().or_else(|| file.server.api_key.clone()),
            room_channel: file
                .channels
                .room
                .clone()
                .unwrap_or(defaults.room_channel),
            private_prefix: file
                .channels
                .private_prefix
                .clone()
                .unwrap_or(defaults.private_prefix),
            reconnect: ReconnectConfig {
                base_delay,
                max_delay,
                health_check,
            },
            connect_timeout: file
                .transport
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            event_buffer: file
                .transport
                .event_buffer
                .unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// The credential to present, preferring the session token.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
        non_empty(&self.session_token)
            .map(Credential::SessionToken)
            .or_else(|| non_empty(&self.api_key).map(Credential::ApiKey))
    }

    /// The channel naming convention.
    #[must_use]
    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout::new(self.room_channel.clone(), self.private_prefix.clone())
    }

    /// Controller tuning derived from this configuration.
    #[must_use]
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            layout: self.layout(),
            backoff: Backoff::new(self.reconnect.base_delay, self.reconnect.max_delay),
            health_check: self.reconnect.health_check,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// WebSocket connector derived from this configuration.
    #[must_use]
    pub const fn connector(&self) -> WsConnector {
        WsConnector::new(self.connect_timeout, self.event_buffer)
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Resilient terminal chat over a pub/sub channel broker")]
pub struct CliArgs {
    /// Base URL of the backend REST API (e.g. `http://localhost:8000/api`).
    #[arg(long, env = "BOWLCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Session token, sent as `Authorization: Bearer`.
    #[arg(long, env = "BOWLCHAT_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,

    /// API key, sent as `X-API-Key` when no session token is given.
    #[arg(long, env = "BOWLCHAT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Path to config file (default: `~/.config/bowlchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BOWLCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/bowlchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("bowlchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
