//! Configuration for the `planner-sync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/planner-sync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use planner_proto::task::UserId;

use crate::cache::{CacheLayer, DEFAULT_CACHE_TTL, FileCacheBackend, MemoryCacheBackend};
use crate::clock::Clock;
use crate::connection::{DEFAULT_HANDSHAKE_TIMEOUT, ReconnectConfig};
use crate::engine::{DEFAULT_SWEEP_INTERVAL, EngineConfig};
use crate::room::DEFAULT_ACTIVITY_TTL;

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

    /// The hub URL is not a `ws://` or `wss://` URL.
    #[error("invalid hub URL {url}: {reason}")]
    InvalidHubUrl {
        /// The rejected value.
        url: String,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    cache: CacheFileConfig,
    presence: PresenceFileConfig,
    workspace: WorkspaceFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    hub_url: Option<String>,
    user_id: Option<String>,
    handshake_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    enabled: Option<bool>,
    ttl_secs: Option<u64>,
    dir: Option<PathBuf>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    activity_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

/// `[workspace]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct WorkspaceFileConfig {
    key: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    // -- Network --
    /// Hub WebSocket URL.
    pub hub_url: Option<String>,
    /// Identity sent in the handshake.
    pub user_id: Option<String>,
    /// Bound on one handshake.
    pub handshake_timeout: Duration,
    /// Capacity of the engine's channels.
    pub channel_capacity: usize,

    // -- Reconnect --
    /// Backoff policy.
    pub reconnect: ReconnectConfig,

    // -- Cache --
    /// Whether snapshots are persisted between runs.
    pub cache_enabled: bool,
    /// How long a snapshot stays usable.
    pub cache_ttl: Duration,
    /// Where snapshots are stored; the user cache dir when unset.
    pub cache_dir: Option<PathBuf>,

    // -- Presence --
    /// How long a peer's activity stays visible.
    pub activity_ttl: Duration,
    /// How often expired activity is swept.
    pub sweep_interval: Duration,

    // -- Workspace --
    /// Workspace to join on startup.
    pub workspace: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hub_url: None,
            user_id: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            cache_enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_dir: None,
            activity_ttl: DEFAULT_ACTIVITY_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            workspace: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path
    /// (`~/.config/planner-sync/config.toml`) is tried and silently ignored
    /// if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `SyncConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separate from `load()` so it can be
    /// tested without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            hub_url: cli.hub_url.clone().or_else(|| file.network.hub_url.clone()),
            user_id: cli.user_id.clone().or_else(|| file.network.user_id.clone()),
            handshake_timeout: file
                .network
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectConfig {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
            },
            cache_enabled: !cli.no_cache && file.cache.enabled.unwrap_or(defaults.cache_enabled),
            cache_ttl: file
                .cache
                .ttl_secs
                .map_or(defaults.cache_ttl, Duration::from_secs),
            cache_dir: file.cache.dir.clone(),
            activity_ttl: file
                .presence
                .activity_ttl_secs
                .map_or(defaults.activity_ttl, Duration::from_secs),
            sweep_interval: file
                .presence
                .sweep_interval_secs
                .map_or(defaults.sweep_interval, Duration::from_secs),
            workspace: cli
                .workspace
                .clone()
                .or_else(|| file.workspace.key.clone()),
        }
    }

    /// The hub URL, checked to be a WebSocket URL.
    ///
    /// Returns `Ok(None)` when no URL is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidHubUrl`] if the URL does not parse or
    /// its scheme is not `ws`/`wss`.
    pub fn hub_url(&self) -> Result<Option<Url>, ConfigError> {
        let Some(raw) = &self.hub_url else {
            return Ok(None);
        };
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidHubUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(Some(url)),
            other => Err(ConfigError::InvalidHubUrl {
                url: raw.clone(),
                reason: format!("unsupported scheme {other:?}, expected ws or wss"),
            }),
        }
    }

    /// Build an [`EngineConfig`], if a user id is configured.
    #[must_use]
    pub fn to_engine_config(&self) -> Option<EngineConfig> {
        let user = self.user_id.as_deref().filter(|u| !u.trim().is_empty())?;
        let mut engine = EngineConfig::new(UserId::new(user.trim()));
        engine.connection.handshake_timeout = self.handshake_timeout;
        engine.connection.reconnect = self.reconnect;
        engine.activity_ttl = self.activity_ttl;
        engine.sweep_interval = self.sweep_interval;
        engine.channel_capacity = self.channel_capacity;
        Some(engine)
    }

    /// Build the snapshot cache this configuration asks for.
    ///
    /// Falls back to an in-memory cache when caching is disabled or no
    /// cache directory can be determined.
    #[must_use]
    pub fn build_cache(&self, clock: Arc<dyn Clock>) -> CacheLayer {
        if !self.cache_enabled {
            return CacheLayer::new(MemoryCacheBackend::default(), clock, self.cache_ttl);
        }
        let backend = self
            .cache_dir
            .clone()
            .map(FileCacheBackend::new)
            .or_else(FileCacheBackend::in_user_cache_dir);
        match backend {
            Some(backend) => CacheLayer::new(backend, clock, self.cache_ttl),
            None => {
                tracing::warn!("no cache directory available, caching in memory only");
                CacheLayer::new(MemoryCacheBackend::default(), clock, self.cache_ttl)
            }
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Realtime workload planner sync client")]
pub struct CliArgs {
    /// WebSocket URL of the hub (e.g. `ws://127.0.0.1:9100/ws`).
    #[arg(long, env = "PLANNER_HUB_URL")]
    pub hub_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "PLANNER_USER")]
    pub user_id: Option<String>,

    /// Workspace to join on startup.
    #[arg(short, long, env = "PLANNER_WORKSPACE")]
    pub workspace: Option<String>,

    /// Path to config file (default: `~/.config/planner-sync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Keep snapshots in memory only.
    #[arg(long)]
    pub no_cache: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PLANNER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/planner-sync.log`).
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
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
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
    let path = config_dir.join("planner-sync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
