// Configuration management for the meshbearer CLI
//
// Cross-platform settings stored in:
// - macOS: ~/Library/Application Support/meshbearer/config.json
// - Linux: ~/.config/meshbearer/config.json
// - Windows: %APPDATA%\meshbearer\config.json

use anyhow::{Context, Result};
use meshbearer_core::BearerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bearer and session settings
    pub bearer: BearerConfig,

    /// Bearer used by `simulate` when none is given ("gatt" or "adv")
    pub default_bearer: String,

    /// ATT MTU assumed by `segment` and `simulate`
    pub default_mtu: u16,

    /// Write logs to this file instead of stderr
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bearer: BearerConfig::default(),
            default_bearer: "gatt".to_string(),
            default_mtu: 23,
            log_file: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshbearer");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.bearer.validate().context("Invalid bearer settings")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Update one value in memory
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let previous = self.bearer.clone();
        match key {
            "max_pdu_len" => {
                self.bearer.max_pdu_len = value.parse().context("Invalid PDU length")?;
            }
            "frame_size_override" => {
                self.bearer.frame_size_override = if value.is_empty() || value == "none" {
                    None
                } else {
                    Some(value.parse().context("Invalid frame size")?)
                };
            }
            "listener_capacity" => {
                self.bearer.listener_capacity = value.parse().context("Invalid number")?;
            }
            "default_bearer" => match value {
                "gatt" | "adv" => self.default_bearer = value.to_string(),
                _ => anyhow::bail!("Unknown bearer: {} (expected gatt or adv)", value),
            },
            "default_mtu" => {
                self.default_mtu = value.parse().context("Invalid MTU")?;
            }
            "log_file" => {
                self.log_file = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        if let Err(e) = self.bearer.validate() {
            self.bearer = previous;
            return Err(e).context("Invalid bearer settings");
        }
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("max_pdu_len".to_string(), self.bearer.max_pdu_len.to_string()),
            (
                "frame_size_override".to_string(),
                self.bearer
                    .frame_size_override
                    .map(|size| size.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            ),
            ("listener_capacity".to_string(), self.bearer.listener_capacity.to_string()),
            ("default_bearer".to_string(), self.default_bearer.clone()),
            ("default_mtu".to_string(), self.default_mtu.to_string()),
            (
                "log_file".to_string(),
                self.log_file.clone().unwrap_or_else(|| "(stderr)".to_string()),
            ),
        ]
    }
}
