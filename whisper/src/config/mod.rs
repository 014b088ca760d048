//! Configuration system for the Whisper client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/whisper/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

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

    /// The live backend was selected without its endpoints.
    #[error("live backend needs `{0}` (set it in [server] or on the command line)")]
    MissingSetting(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    sync: SyncFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_url: Option<String>,
    ws_url: Option<String>,
    token: Option<String>,
    user_id: Option<String>,
    backend: Option<BackendKind>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    page_size: Option<usize>,
    confirm_timeout_secs: Option<u64>,
    history_timeout_secs: Option<u64>,
    soft_failure_grace_ms: Option<u64>,
    typing_quiet_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Which backend the client talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The real REST + WebSocket server.
    Live,
    /// The in-process [`crate::sim::SimulatedServer`].
    #[default]
    Simulated,
}

/// Tunables of a conversation session (used by [`crate::sync::Session`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Messages requested per history page.
    pub page_size: usize,
    /// Upper bound on the request/response send.
    pub confirm_timeout: Duration,
    /// Upper bound on a history fetch.
    pub history_timeout: Duration,
    /// Wait before an ambiguously failed send is shown as sent.
    pub soft_failure_grace: Duration,
    /// Quiet period after the last keystroke before `stopTyping`.
    pub typing_quiet: Duration,
    /// Capacity of the [`crate::sync::SyncEvent`] channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            confirm_timeout: Duration::from_secs(10),
            history_timeout: Duration::from_secs(10),
            soft_failure_grace: Duration::from_millis(1500),
            typing_quiet: Duration::from_secs(3),
            event_buffer: 256,
        }
    }
}

/// Transport reconnection budget (used by [`crate::sync::ConnectionManager`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Connection attempts before the session degrades to request/response.
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub backoff: Duration,
    /// Upper bound on a single connection handshake.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Endpoints and credential of the live backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEndpoints {
    /// REST API root.
    pub api_url: String,
    /// WebSocket root.
    pub ws_url: String,
    /// Bearer token, if any.
    pub token: Option<String>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Which backend to use.
    pub backend: BackendKind,
    /// REST API root URL.
    pub api_url: Option<String>,
    /// WebSocket root URL.
    pub ws_url: Option<String>,
    /// Bearer token.
    pub token: Option<String>,
    /// Local user's id.
    pub user_id: String,
    /// Conversation to open on start.
    pub conversation: Option<String>,

    // -- Core --
    /// Session tunables.
    pub sync: SyncConfig,
    /// Reconnection budget.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            api_url: None,
            ws_url: None,
            token: None,
            user_id: "me".to_string(),
            conversation: None,
            sync: SyncConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/whisper/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. This is separated from `load()` to
    /// enable unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            backend: cli
                .backend
                .or(file.server.backend)
                .unwrap_or(defaults.backend),
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            ws_url: cli.ws_url.clone().or_else(|| file.server.ws_url.clone()),
            token: cli.token.clone().or_else(|| file.server.token.clone()),
            user_id: cli
                .user
                .clone()
                .or_else(|| file.server.user_id.clone())
                .unwrap_or(defaults.user_id),
            conversation: cli.conversation.clone(),
            sync: SyncConfig {
                page_size: file
                    .sync
                    .page_size
                    .filter(|&n| n > 0)
                    .unwrap_or(defaults.sync.page_size),
                confirm_timeout: file
                    .sync
                    .confirm_timeout_secs
                    .map_or(defaults.sync.confirm_timeout, Duration::from_secs),
                history_timeout: file
                    .sync
                    .history_timeout_secs
                    .map_or(defaults.sync.history_timeout, Duration::from_secs),
                soft_failure_grace: file
                    .sync
                    .soft_failure_grace_ms
                    .map_or(defaults.sync.soft_failure_grace, Duration::from_millis),
                typing_quiet: file
                    .sync
                    .typing_quiet_secs
                    .map_or(defaults.sync.typing_quiet, Duration::from_secs),
                event_buffer: file
                    .sync
                    .event_buffer
                    .filter(|&n| n > 0)
                    .unwrap_or(defaults.sync.event_buffer),
            },
            reconnect: ReconnectConfig {
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                backoff: file
                    .reconnect
                    .backoff_ms
                    .map_or(defaults.reconnect.backoff, Duration::from_millis),
                connect_timeout: file
                    .reconnect
                    .connect_timeout_secs
                    .map_or(defaults.reconnect.connect_timeout, Duration::from_secs),
            },
        }
    }

    /// Endpoints of the live backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSetting`] if `api_url` or `ws_url` is
    /// unset.
    pub fn live_endpoints(&self) -> Result<LiveEndpoints, ConfigError> {
        let api_url = self
            .api_url
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSetting("api_url"))?;
        let ws_url = self
            .ws_url
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSetting("ws_url"))?;
        Ok(LiveEndpoints {
            api_url,
            ws_url,
            token: self.token.clone(),
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time chat sync client")]
pub struct CliArgs {
    /// Conversation to open.
    #[arg(long, env = "WHISPER_CONVERSATION")]
    pub conversation: Option<String>,

    /// Backend to talk to.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// REST API root URL.
    #[arg(long, env = "WHISPER_API_URL")]
    pub api_url: Option<String>,

    /// WebSocket root URL.
    #[arg(long, env = "WHISPER_WS_URL")]
    pub ws_url: Option<String>,

    /// Bearer token.
    #[arg(long, env = "WHISPER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Your user id.
    #[arg(long, env = "WHISPER_USER")]
    pub user: Option<String>,

    /// Path to config file (default: `~/.config/whisper/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "WHISPER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/whisper.log`).
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
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("whisper").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
