//! Configuration loading and persistence.
//!
//! Reads and writes the agenthub configuration file as JSON under the
//! platform config directory. A missing file yields defaults.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// User configuration for the CLI and the helper.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Seconds between the helper's periodic update checks.
    pub check_interval_secs: u64,
    /// Whether the helper pushes `update_available` notifications.
    pub notify_on_updates: bool,
    /// Override for the IPC address (testing and non-standard setups).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_override: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval_secs: 3600,
            notify_on_updates: true,
            socket_override: None,
        }
    }
}

impl Config {
    /// Path of the config file under `platform`'s config directory.
    pub fn file_path(platform: &Platform) -> PathBuf {
        platform.config_dir().join("config.json")
    }

    /// Load the configuration, falling back to defaults when the file does
    /// not exist.
    pub fn load(platform: &Platform) -> Result<Self> {
        let path = Self::file_path(platform);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Persist the configuration.
    pub fn save(&self, platform: &Platform) -> Result<()> {
        platform.ensure_dirs()?;
        let path = Self::file_path(platform);
        let contents = serde_json::to_string_pretty(self).context("Failed to encode config")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// The IPC address the helper binds and the CLI dials.
    pub fn socket_address(&self, platform: &Platform) -> String {
        self.socket_override
            .clone()
            .unwrap_or_else(|| platform.socket_address())
    }
}
