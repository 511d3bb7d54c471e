use anyhow::{bail, Context, Result};
use backup_engine::config::{EngineConfig, LogConfig};
use backup_engine::outcome::flags;
use backup_engine::transport::local::LocalTransportOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Dirty-tracking journal; when set, an empty command line backs up what it lists
    #[serde(default)]
    pub journal: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Application identifier -> data directory
    #[serde(default)]
    pub apps: BTreeMap<String, PathBuf>,

    /// File or directory names skipped by the directory agents
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_destination")]
    pub destination: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Per-item payload limit in bytes
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Advertise client-side encryption to agents
    #[serde(default)]
    pub client_side_encryption: bool,
}

fn default_destination() -> String {
    "local".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/sets")
}

fn default_compression_level() -> i32 {
    3
}

fn default_exclude() -> Vec<String> {
    vec![".git".to_string(), ".DS_Store".to_string()]
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            output_dir: default_output_dir(),
            quota_bytes: None,
            compression_level: default_compression_level(),
            client_side_encryption: false,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            journal: None,
            engine: EngineConfig::default(),
            log: LogConfig::default(),
            transport: TransportConfig::default(),
            apps: BTreeMap::new(),
            exclude: default_exclude(),
        }
    }
}

impl RunnerConfig {
    /// Load from an optional TOML file, then apply `.env` / environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RunnerConfig = toml::from_str(content).context("Invalid runner config")?;
        if config.engine.agent_timeout_secs == 0 {
            bail!("engine.agent_timeout_secs must be greater than zero");
        }
        Ok(config)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("BACKUP_STATE_DIR") {
            self.engine.state_dir = PathBuf::from(dir);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    pub fn transport_options(&self) -> LocalTransportOptions {
        LocalTransportOptions {
            root: self.transport.output_dir.clone(),
            destination: self.transport.destination.clone(),
            quota_bytes: self.transport.quota_bytes,
            transport_flags: if self.transport.client_side_encryption {
                flags::CLIENT_SIDE_ENCRYPTION_ENABLED
            } else {
                0
            },
            compression_level: self.transport.compression_level,
        }
    }
}
