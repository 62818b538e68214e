//! Configuration loader with file and environment variable support

use std::env;
use std::path::PathBuf;

use tracing::info;

use crate::{AppConfig, ConfigError};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "blastline.toml",
    "./config/blastline.toml",
    "/etc/blastline/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides applied on top.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("BLASTLINE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("BLASTLINE_STORE_BACKEND") {
            config.store.backend = val;
        }
        if let Ok(val) = env::var("BLASTLINE_SQLITE_URL") {
            config.store.sqlite_url = val;
        }
        if let Ok(val) = env::var("BLASTLINE_RETRY_TICK_SECS") {
            if let Ok(secs) = val.parse() {
                config.engine.retry_tick_secs = secs;
            }
        }
        if let Ok(val) = env::var("BLASTLINE_SHUTDOWN_GRACE_SECS") {
            if let Ok(secs) = val.parse() {
                config.engine.shutdown_grace_secs = secs;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
