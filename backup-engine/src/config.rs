//! Configuration management for the backup engine.
//!
//! Loaded from the `[engine]` and `[log]` tables of a TOML file; every field has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the per-destination state directories
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Upper bound for one agent `on_backup` round trip
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Upper bound for the transport's `finish_backup`
    #[serde(default = "default_finish_timeout_secs")]
    pub finish_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/state")
}

fn default_agent_timeout_secs() -> u64 {
    30
}

fn default_finish_timeout_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            agent_timeout_secs: default_agent_timeout_secs(),
            finish_timeout_secs: default_finish_timeout_secs(),
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
        Self {
            engine: EngineConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.engine.agent_timeout_secs == 0 {
            return Err(crate::EngineError::Config(
                "engine.agent_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}
