//! Configuration management for incus-backup.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every field has a default, so an empty file (or no file) is valid.

use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `[target] default`.
pub const TARGET_ENV: &str = "INCUS_BACKUP_TARGET";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub restic: ResticConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target URI used when `--target` is not given (e.g. `dir:/srv/backups`)
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Path or name of the incus client binary
    #[serde(default = "default_incus_binary")]
    pub incus_binary: PathBuf,

    /// Project used when `--project` is not given
    #[serde(default = "default_project")]
    pub project: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResticConfig {
    /// Explicit restic binary; looked up on PATH when unset
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Minimum supported restic version
    #[serde(default = "default_required_version")]
    pub required_version: String,

    /// Upper bound for the `restic version` probe
    #[serde(default = "default_version_timeout_secs")]
    pub version_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunks buffered between producer and consumer
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Read size in bytes (default: 64KB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Minimum delay between progress callbacks
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Versions kept per resource when `--keep` is not given
    #[serde(default)]
    pub keep: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_incus_binary() -> PathBuf {
    PathBuf::from("incus")
}

fn default_project() -> String {
    "default".to_string()
}

fn default_required_version() -> String {
    "0.18.0".to_string()
}

fn default_version_timeout_secs() -> u64 {
    5
}

fn default_pipe_capacity() -> usize {
    8
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64KB
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            incus_binary: default_incus_binary(),
            project: default_project(),
        }
    }
}

impl Default for ResticConfig {
    fn default() -> Self {
        Self {
            binary: None,
            required_version: default_required_version(),
            version_timeout_secs: default_version_timeout_secs(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: default_pipe_capacity(),
            chunk_size: default_chunk_size(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target: TargetConfig::default(),
            host: HostConfig::default(),
            restic: ResticConfig::default(),
            transfer: TransferConfig::default(),
            prune: PruneConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(target) = std::env::var(TARGET_ENV) {
            if !target.trim().is_empty() {
                self.target.default = Some(target);
            }
        }
        self
    }

    pub fn version_timeout(&self) -> Duration {
        Duration::from_secs(self.restic.version_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.transfer.progress_interval_ms)
    }
}
