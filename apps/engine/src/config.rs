//! Engine configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Engine configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Filesystem path for the streaming socket.
    /// Override: `SOCKET_PATH`
    pub socket_path: PathBuf,

    /// TCP port for the HTTP control plane.
    /// Override: `CONTROL_PORT`
    pub control_port: u16,

    /// Maximum concurrent sessions.
    pub max_concurrent_sessions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = baton_core::Config::default();
        Self {
            socket_path: defaults.socket_path,
            control_port: defaults.control_port,
            max_concurrent_sessions: defaults.streaming.max_concurrent_sessions,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SOCKET_PATH") {
            if !val.is_empty() {
                self.socket_path = PathBuf::from(val);
            }
        }
        if let Ok(val) = std::env::var("CONTROL_PORT") {
            if let Ok(port) = val.parse() {
                self.control_port = port;
            }
        }
    }

    /// Converts to baton-core's Config type.
    pub fn to_core_config(&self) -> baton_core::Config {
        let mut config = baton_core::Config {
            socket_path: self.socket_path.clone(),
            control_port: self.control_port,
            ..Default::default()
        };
        config.streaming.max_concurrent_sessions = self.max_concurrent_sessions;
        config
    }
}
