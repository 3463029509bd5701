//! Layered configuration: built-in defaults, optional TOML file,
//! `DROVER_*` environment overrides.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker subprocess settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker command line: program followed by arguments.
    pub command: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: vec!["drover-worker".to_string()],
        }
    }
}

/// Sidecar service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SidecarSettings {
    pub base_url: String,
    /// Shared token, sent as `X-Sidecar-Token`.
    pub token: Option<String>,
    /// Per-read SSE timeout in seconds; must exceed the sidecar's
    /// heartbeat interval.
    pub read_timeout_s: u64,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8788".to_string(),
            token: None,
            read_timeout_s: 60,
        }
    }
}

/// In-process API adapter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
        }
    }
}

/// External session discovery overrides. Unset fields use each backend's
/// default on-disk location.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub claude_projects_dir: Option<String>,
    pub codex_sessions_dir: Option<String>,
    pub pi_sessions_dir: Option<String>,
}

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    /// Listen address for the HTTP surface.
    pub bind: String,
    /// Data directory (database + journals). Empty means the platform
    /// default.
    pub data_dir: String,
    /// Bearer token required on every API request. Empty disables auth
    /// (development only).
    pub auth_token: Option<String>,
    /// Adapter used when a session does not name one.
    pub default_adapter: String,
    /// Journal rotation threshold in bytes.
    pub journal_max_bytes: u64,
    /// Pending permissions resolve as deny after this many seconds.
    pub permission_timeout_s: u64,
    /// Heartbeat cadence for in-process runners.
    pub heartbeat_interval_s: u64,
    /// Sessions older than this many days are pruned at startup (0 = never).
    pub retention_days: i64,
    pub worker: WorkerSettings,
    pub sidecar: SidecarSettings,
    pub api: ApiSettings,
    pub discovery: DiscoverySettings,
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            data_dir: String::new(),
            auth_token: None,
            default_adapter: "subprocess".to_string(),
            journal_max_bytes: crate::store::journal::DEFAULT_MAX_BYTES,
            permission_timeout_s: 300,
            heartbeat_interval_s: 5,
            retention_days: 0,
            worker: WorkerSettings::default(),
            sidecar: SidecarSettings::default(),
            api: ApiSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl DroverConfig {
    /// Load configuration, layering an optional file and the environment
    /// over defaults. Environment keys use `DROVER_` with `__` as the
    /// nesting separator (e.g. `DROVER_SIDECAR__BASE_URL`).
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        match file {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if let Some(default_path) = Self::default_file_path() {
                    builder = builder.add_source(File::from(default_path).required(false));
                }
            }
        }
        builder = builder.add_source(Environment::with_prefix("DROVER").separator("__"));
        let config = builder.build().context("building configuration")?;
        config
            .try_deserialize()
            .context("deserializing configuration")
    }

    /// Default config file location (`<config-dir>/drover/drover.toml`).
    pub fn default_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("drover").join("drover.toml"))
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        if !self.data_dir.is_empty() {
            return PathBuf::from(&self.data_dir);
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("drover")
    }

    /// SQLite database path inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("drover.db")
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_timeout_s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn sidecar_read_timeout(&self) -> Duration {
        Duration::from_secs(self.sidecar.read_timeout_s)
    }

    /// Scanner root overrides from the discovery section.
    pub fn scanner_config(&self) -> crate::discovery::ScannerConfig {
        crate::discovery::ScannerConfig {
            claude_projects_dir: self.discovery.claude_projects_dir.clone().map(PathBuf::from),
            codex_sessions_dir: self.discovery.codex_sessions_dir.clone().map(PathBuf::from),
            pi_sessions_dir: self.discovery.pi_sessions_dir.clone().map(PathBuf::from),
        }
    }
}
