//! Tunables for scanning, linking and flooding

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Standard serial port profile service identifier
pub const SERIAL_PORT_SERVICE_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// Connection-oriented channel used by the flood loop when none is given
pub const DEFAULT_FLOOD_PSM: u16 = 0x1001;

pub const DEFAULT_SCAN_WINDOW_SECS: u64 = 30;
pub const DEFAULT_FLOOD_PAUSE_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration for the link subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a scan stays open before it stops on its own
    pub scan_window_secs: u64,
    /// Channel identifier for `attack` requests without one
    pub default_psm: u16,
    /// Pause between flood iterations
    pub flood_pause_ms: u64,
    /// Service record used for direct serial connections
    pub serial_service_uuid: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_window_secs: DEFAULT_SCAN_WINDOW_SECS,
            default_psm: DEFAULT_FLOOD_PSM,
            flood_pause_ms: DEFAULT_FLOOD_PAUSE_MS,
            serial_service_uuid: SERIAL_PORT_SERVICE_UUID.to_string(),
        }
    }
}

impl LinkConfig {
    pub fn with_scan_window(mut self, secs: u64) -> Self {
        self.scan_window_secs = secs;
        self
    }

    pub fn with_flood_pause(mut self, ms: u64) -> Self {
        self.flood_pause_ms = ms;
        self
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    pub fn flood_pause(&self) -> Duration {
        Duration::from_millis(self.flood_pause_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "scan_window_secs must be > 0".to_string(),
            ));
        }
        if self.default_psm == 0 {
            return Err(ConfigError::Invalid("default_psm must be > 0".to_string()));
        }
        if self.flood_pause_ms == 0 {
            return Err(ConfigError::Invalid(
                "flood_pause_ms must be > 0".to_string(),
            ));
        }
        if self.serial_service_uuid.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "serial_service_uuid cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.scan_window(), Duration::from_secs(30));
        assert_eq!(config.default_psm, 0x1001);
        assert_eq!(config.flood_pause(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = LinkConfig::default().with_scan_window(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pause_rejected() {
        let config = LinkConfig::default().with_flood_pause(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{"scan_window_secs": 12}"#).expect("parse");
        assert_eq!(config.scan_window_secs, 12);
        assert_eq!(config.default_psm, DEFAULT_FLOOD_PSM);
        assert_eq!(config.serial_service_uuid, SERIAL_PORT_SERVICE_UUID);
    }
}
