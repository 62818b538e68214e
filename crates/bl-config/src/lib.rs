//! Process-level configuration
//!
//! Settings for the binaries that host the engine: which store backend to
//! use, the retry governor cadence, and the loop shutdown grace. Loaded
//! from a TOML file with `BLASTLINE_*` environment overrides on top.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.store.backend.as_str() {
            "memory" | "sqlite" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown store backend: {other} (expected \"memory\" or \"sqlite\")"
                )))
            }
        }
        if self.engine.retry_tick_secs == 0 {
            return Err(ConfigError::Invalid("engine.retry_tick_secs must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// "memory" or "sqlite".
    pub backend: String,
    /// SQLite database URL when backend = "sqlite".
    pub sqlite_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_url: "sqlite::memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry governor tick interval, seconds.
    pub retry_tick_secs: u64,
    /// How long a stopping loop gets before it is aborted, seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_tick_secs: 60,
            shutdown_grace_secs: 60,
        }
    }
}
