//! Orchestrator configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The recognized environment keys match the deployment contract:
//! `SOCKET_PATH`, `CONTROL_PORT`, `DATA_DIR`, `DEBUG_AUDIO`, `WEB_AUDIO`,
//! `ALLOWED_IDS`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use baton_core::AdapterMode;
use serde::Deserialize;

/// Orchestrator configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Filesystem path of the engine's streaming socket.
    /// Override: `SOCKET_PATH`
    pub socket_path: PathBuf,

    /// TCP port of the engine's control plane.
    /// Override: `CONTROL_PORT`
    pub control_port: u16,

    /// TCP port for the consumer WebSocket server.
    pub consumer_port: u16,

    /// Directory for the persisted session store.
    /// Override: `DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Client adapter variant.
    /// Overrides: `DEBUG_AUDIO` (jitter), `WEB_AUDIO` (browser)
    pub adapter: AdapterMode,

    /// Optional whitelist of consumer ids.
    /// Override: `ALLOWED_IDS` (comma-separated)
    pub allowed_ids: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let defaults = baton_core::Config::default();
        Self {
            socket_path: defaults.socket_path,
            control_port: defaults.control_port,
            consumer_port: defaults.consumer_port,
            data_dir: None,
            adapter: AdapterMode::default(),
            allowed_ids: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
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
        if let Ok(val) = std::env::var("DATA_DIR") {
            if !val.is_empty() {
                self.data_dir = Some(PathBuf::from(val));
            }
        }
        if env_flag("DEBUG_AUDIO") {
            self.adapter = AdapterMode::Jitter;
        }
        if env_flag("WEB_AUDIO") {
            self.adapter = AdapterMode::Browser;
        }
        if let Ok(val) = std::env::var("ALLOWED_IDS") {
            self.allowed_ids = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Converts to baton-core's Config type.
    pub fn to_core_config(&self) -> baton_core::Config {
        baton_core::Config {
            socket_path: self.socket_path.clone(),
            control_port: self.control_port,
            consumer_port: self.consumer_port,
            data_dir: self.data_dir.clone(),
            adapter: self.adapter,
            allowed_ids: self.allowed_ids.clone(),
            ..Default::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
