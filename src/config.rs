//! Instrument configuration, read from an optional JSON file.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::channel::{DEFAULT_AVERAGING, MAX_AVERAGING, MIN_AVERAGING};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What `*IDN?` and `SYSTem:VERSion?` report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub version: String,
    pub scpi_version: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            manufacturer: "HomeLab".into(),
            model: "RFPM-2CH".into(),
            serial: "001".into(),
            version: "1.0.0".into(),
            scpi_version: "1999.0".into(),
        }
    }
}

/// Addresses reported by `SYSTem:NET:*`. The meter core does no networking;
/// these come from whatever brought the interface up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub averaging_default: u32,  // Samples averaged per reading after *RST
    pub mux_ports: [u8; 2],      // Multiplexer port of each channel's EEPROM
    pub sensor_read_ms: u64,     // ADC sampling period
    pub hotswap_poll_ms: u64,    // Presence flag polling period
    pub recorder_ms: u64,        // Reading log period
    pub run_seconds: u64,        // 0 = run until stdin closes
    pub log_dir: PathBuf,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            averaging_default: DEFAULT_AVERAGING,
            mux_ports: [0, 1],
            sensor_read_ms: 50,
            hotswap_poll_ms: 100,
            recorder_ms: 1000,
            run_seconds: 0,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl MeterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: MeterConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_AVERAGING..=MAX_AVERAGING).contains(&self.averaging_default) {
            return Err(ConfigError::Invalid(format!(
                "averaging_default {} outside {}..={}",
                self.averaging_default, MIN_AVERAGING, MAX_AVERAGING
            )));
        }
        if self.mux_ports.iter().any(|&p| p > 7) {
            return Err(ConfigError::Invalid(format!(
                "mux_ports {:?} must be 0-7",
                self.mux_ports
            )));
        }
        if self.mux_ports.iter().collect::<HashSet<_>>().len() != self.mux_ports.len() {
            return Err(ConfigError::Invalid("mux_ports must be distinct".into()));
        }
        if [self.sensor_read_ms, self.hotswap_poll_ms, self.recorder_ms].contains(&0) {
            return Err(ConfigError::Invalid("task periods must be non-zero".into()));
        }
        Ok(())
    }

    pub fn sensor_period(&self) -> Duration {
        Duration::from_millis(self.sensor_read_ms)
    }

    pub fn hotswap_period(&self) -> Duration {
        Duration::from_millis(self.hotswap_poll_ms)
    }

    pub fn recorder_period(&self) -> Duration {
        Duration::from_millis(self.recorder_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = MeterConfig::from_json("{}").unwrap();
        assert_eq!(config, MeterConfig::default());
        assert_eq!(config.identity.model, "RFPM-2CH");
        assert_eq!(config.averaging_default, 16);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = MeterConfig::from_json(
            r#"{"identity": {"serial": "042"}, "network": {"ip": "10.0.0.7"}, "mux_ports": [2, 3]}"#,
        )
        .unwrap();
        assert_eq!(config.identity.serial, "042");
        assert_eq!(config.identity.manufacturer, "HomeLab");
        assert_eq!(config.network.ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(config.mux_ports, [2, 3]);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            MeterConfig::from_json(r#"{"averaging_default": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MeterConfig::from_json(r#"{"mux_ports": [1, 1]}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MeterConfig::from_json(r#"{"sensor_read_ms": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MeterConfig::from_json("{not json"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
