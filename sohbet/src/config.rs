//! Configuration for the Sohbet client.
//!
//! Layered with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/sohbet/config.toml`)
//! 4. Compiled defaults
//!
//! A missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    reconnect: ReconnectFileConfig,
    session: SessionFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    ws_url: Option<String>,
    token: Option<String>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    frame_buffer: Option<usize>,
    event_buffer: Option<usize>,
    directory_limit: Option<usize>,
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// HTTP base URL of the chat backend.
    pub server_url: Option<String>,
    /// WebSocket base URL; derived from `server_url` when not given.
    pub ws_url: Option<String>,
    /// Bearer token identifying the authenticated user.
    pub token: Option<String>,

    // -- Reconnect --
    /// Delay before the first reconnect attempt.
    pub reconnect_initial_delay: Duration,
    /// Cap on the doubled reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Optional cap on consecutive failed attempts.
    pub reconnect_max_attempts: Option<u32>,

    // -- Session --
    /// Capacity of the inbound frame channel.
    pub frame_buffer: usize,
    /// Capacity of the session event channel.
    pub event_buffer: usize,
    /// How many directory entries to request for peer selection.
    pub directory_limit: usize,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            ws_url: None,
            token: None,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: None,
            frame_buffer: 256,
            event_buffer: 64,
            directory_limit: 20,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicitly given config file cannot be
    /// read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server_url: cli.server_url.clone().or_else(|| file.server.url.clone()),
            ws_url: cli.ws_url.clone().or_else(|| file.server.ws_url.clone()),
            token: cli.token.clone().or_else(|| file.server.token.clone()),
            reconnect_initial_delay: file
                .reconnect
                .initial_delay_ms
                .map_or(defaults.reconnect_initial_delay, Duration::from_millis),
            reconnect_max_delay: file
                .reconnect
                .max_delay_ms
                .map_or(defaults.reconnect_max_delay, Duration::from_millis),
            reconnect_max_attempts: file
                .reconnect
                .max_attempts
                .or(defaults.reconnect_max_attempts),
            frame_buffer: file.session.frame_buffer.unwrap_or(defaults.frame_buffer),
            event_buffer: file.session.event_buffer.unwrap_or(defaults.event_buffer),
            directory_limit: file
                .session
                .directory_limit
                .unwrap_or(defaults.directory_limit),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.session.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// The WebSocket base URL: explicit `ws_url`, or `server_url` with its
    /// scheme swapped (`http` → `ws`, `https` → `wss`).
    #[must_use]
    pub fn resolved_ws_url(&self) -> Option<String> {
        if let Some(ws) = &self.ws_url {
            return Some(ws.clone());
        }
        let http = self.server_url.as_deref()?;
        if let Some(rest) = http.strip_prefix("https://") {
            Some(format!("wss://{rest}"))
        } else if let Some(rest) = http.strip_prefix("http://") {
            Some(format!("ws://{rest}"))
        } else {
            Some(http.to_string())
        }
    }

    /// Build the reconnect policy configuration from resolved settings.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time messaging client")]
pub struct CliArgs {
    /// HTTP base URL of the chat backend.
    #[arg(long, env = "SOHBET_SERVER_URL")]
    pub server_url: Option<String>,

    /// WebSocket base URL (default: derived from the server URL).
    #[arg(long, env = "SOHBET_WS_URL")]
    pub ws_url: Option<String>,

    /// Bearer token identifying the authenticated user.
    #[arg(long, env = "SOHBET_TOKEN")]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/sohbet/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "SOHBET_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/sohbet.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available — use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("sohbet").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
