//! CLI configuration management.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// PostgreSQL connection string; the in-memory store is used when
    /// unset.
    pub database_url: Option<String>,
    /// Directory of DAG definition files.
    #[serde(default = "default_dags_dir")]
    pub dags_dir: String,
    /// Seconds between scheduler evaluation cycles.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Seconds the executor may fail its liveness probe before its
    /// in-flight instances are reclaimed.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Worker count of the local executor.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_dags_dir() -> String {
    "dags".to_string()
}

fn default_tick_secs() -> u64 {
    5
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_parallelism() -> usize {
    8
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            dags_dir: default_dags_dir(),
            tick_secs: default_tick_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            parallelism: default_parallelism(),
        }
    }
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = directories::ProjectDirs::from("dev", "skein", "skein")
            .ok_or("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "database_url" => self.database_url = Some(value.to_string()),
            "dags_dir" => self.dags_dir = value.to_string(),
            "tick_secs" => {
                self.tick_secs = value
                    .parse()
                    .map_err(|_| format!("Invalid tick_secs: {}", value))?;
            }
            "heartbeat_timeout_secs" => {
                self.heartbeat_timeout_secs = value
                    .parse()
                    .map_err(|_| format!("Invalid heartbeat_timeout_secs: {}", value))?;
            }
            "parallelism" => {
                self.parallelism = value
                    .parse()
                    .map_err(|_| format!("Invalid parallelism: {}", value))?;
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}
