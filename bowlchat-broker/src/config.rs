//! Configuration system for the `BowlChat` broker.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/bowlchat-broker/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use bowlchat_proto::descriptor::{ChannelLayout, DEFAULT_PRIVATE_PREFIX, DEFAULT_ROOM_CHANNEL};

use crate::broker::{BrokerState, DEFAULT_HEARTBEAT};

/// Errors that can occur when loading broker configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the broker.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BrokerConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the broker config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    public_url: Option<String>,
    room_channel: Option<String>,
    private_prefix: Option<String>,
    heartbeat_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the broker.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "BowlChat development broker")]
pub struct BrokerCliArgs {
    /// Address to bind the broker to.
    #[arg(short, long, env = "BOWLCHAT_BROKER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/bowlchat-broker/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// WebSocket URL advertised in connection descriptors.
    #[arg(long)]
    pub public_url: Option<String>,

    /// Seconds between heartbeat pings; 0 disables them.
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BOWLCHAT_BROKER_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind the server to (e.g., `127.0.0.1:8000`).
    pub bind_addr: String,
    /// Advertised WebSocket URL; derived from the bound address when unset.
    pub public_url: Option<String>,
    /// Shared room channel.
    pub room_channel: String,
    /// Prefix for private channels.
    pub private_prefix: String,
    /// Heartbeat interval; `None` disables pings.
    pub heartbeat: Option<Duration>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            public_url: None,
            room_channel: DEFAULT_ROOM_CHANNEL.to_string(),
            private_prefix: DEFAULT_PRIVATE_PREFIX.to_string(),
            heartbeat: Some(DEFAULT_HEARTBEAT),
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &BrokerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `BrokerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &BrokerCliArgs, file: &BrokerConfigFile) -> Self {
        let defaults = Self::default();

        let heartbeat = match cli.heartbeat_secs.or(file.server.heartbeat_secs) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.heartbeat,
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            public_url: cli
                .public_url
                .clone()
                .or_else(|| file.server.public_url.clone()),
            room_channel: file
                .server
                .room_channel
                .clone()
                .unwrap_or(defaults.room_channel),
            private_prefix: file
                .server
                .private_prefix
                .clone()
                .unwrap_or(defaults.private_prefix),
            heartbeat,
            log_level: cli.log_level.clone(),
        }
    }

    /// Broker state for this configuration. The public URL is applied by
    /// the caller once known.
    #[must_use]
    pub fn state(&self) -> BrokerState {
        BrokerState::with_config(
            ChannelLayout::new(self.room_channel.as_str(), self.private_prefix.as_str()),
            self.heartbeat,
        )
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the broker.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<BrokerConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(BrokerConfigFile::default());
    };
    let path = config_dir.join("bowlchat-broker").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
