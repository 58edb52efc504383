// Configuration management for the bluelink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/bluelink/config.json
// - Linux: ~/.config/bluelink/config.json
// - Windows: %APPDATA%\bluelink\config.json

use anyhow::{Context, Result};
use bluelink_core::LinkConfig;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which radio the session talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// First adapter found by btleplug
    Btle,
    /// In-memory radio, nothing leaves the process
    Loopback,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Btle => write!(f, "btle"),
            Backend::Loopback => write!(f, "loopback"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Radio backend used when none is given on the command line
    pub backend: Backend,

    /// Scan, link and flood tunables
    pub link: LinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Btle,
            link: LinkConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("bluelink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            Self::from_json(&contents)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    fn from_json(contents: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(contents).context("Failed to parse config file")?;
        config.link.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "backend" => {
                updated.backend = Backend::from_str(value, true)
                    .map_err(|e| anyhow::anyhow!("Invalid backend: {}", e))?;
            }
            "scan_window_secs" => {
                updated.link.scan_window_secs = value.parse().context("Invalid number")?;
            }
            "default_psm" => {
                updated.link.default_psm = parse_psm(value)?;
            }
            "flood_pause_ms" => {
                updated.link.flood_pause_ms = value.parse().context("Invalid number")?;
            }
            "serial_service_uuid" => {
                updated.link.serial_service_uuid = value.to_string();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.link.validate()?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "backend" => Some(self.backend.to_string()),
            "scan_window_secs" => Some(self.link.scan_window_secs.to_string()),
            "default_psm" => Some(format!("{:#06x}", self.link.default_psm)),
            "flood_pause_ms" => Some(self.link.flood_pause_ms.to_string()),
            "serial_service_uuid" => Some(self.link.serial_service_uuid.clone()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        ["backend", "scan_window_secs", "default_psm", "flood_pause_ms", "serial_service_uuid"]
            .iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

/// Accepts decimal or `0x`-prefixed hex
fn parse_psm(value: &str) -> Result<u16> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("Invalid PSM: {}", value))
}
