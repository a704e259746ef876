//! Probe and OTA configuration
//!
//! The [Config] type holds the timings used by active probes and the sector
//! size of the `otadata` partition. It can be built from TOML text; locating
//! and reading the file is left to the caller.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    ota::{OTA_SELECT_ENTRY_SIZE, OTA_SELECT_SECTOR_SIZE},
    Error,
};

/// Timings and limits used while probing a device
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Delay between two looks at the receive buffer, in milliseconds
    pub poll_interval_ms: u64,
    /// How long to wait for a response packet after a probe, in milliseconds
    pub response_timeout_ms: u64,
    /// How long to wait for a banner after the fallback line terminator, in
    /// milliseconds
    pub banner_timeout_ms: u64,
    /// Number of trailing buffered bytes inspected by a probe
    pub snapshot_bytes: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
            response_timeout_ms: 250,
            banner_timeout_ms: 150,
            snapshot_bytes: 4096,
        }
    }
}

impl ProbeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }
}

/// Layout of the `otadata` partition
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct OtaConfig {
    /// Size of one OTA selection sector, in bytes
    pub sector_size: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            sector_size: OTA_SELECT_SECTOR_SIZE,
        }
    }
}

/// Complete configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Active and passive probe settings
    #[serde(default)]
    pub probe: ProbeConfig,
    /// OTA selection partition settings
    #[serde(default)]
    pub ota: OtaConfig,
}

impl Config {
    /// Parse and validate a configuration from TOML text.
    ///
    /// Missing tables and keys fall back to their defaults.
    pub fn from_toml(raw: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;

        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    /// Check that the values can drive a probe and an OTA scan
    pub fn validate(&self) -> Result<(), Error> {
        if self.probe.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "`probe.poll_interval_ms` must be greater than zero".into(),
            ));
        }
        if self.probe.snapshot_bytes == 0 {
            return Err(Error::InvalidConfig(
                "`probe.snapshot_bytes` must be greater than zero".into(),
            ));
        }
        if self.ota.sector_size < OTA_SELECT_ENTRY_SIZE {
            return Err(Error::InvalidConfig(format!(
                "`ota.sector_size` must be at least {OTA_SELECT_ENTRY_SIZE} bytes, got {}",
                self.ota.sector_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.probe.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.probe.response_timeout(), Duration::from_millis(250));
        assert_eq!(config.probe.banner_timeout(), Duration::from_millis(150));
        assert_eq!(config.ota.sector_size, 0x1000);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = Config::from_toml(
            r#"
            [probe]
            response_timeout_ms = 500

            [ota]
            sector_size = 0x2000
            "#,
        )
        .unwrap();

        assert_eq!(config.probe.response_timeout_ms, 500);
        assert_eq!(config.probe.poll_interval_ms, 20);
        assert_eq!(config.ota.sector_size, 0x2000);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            Config::from_toml("[probe]\npoll_interval_ms = 0"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::from_toml("[ota]\nsector_size = 16"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::from_toml("[probe]\npoll_interval_ms = \"fast\""),
            Err(Error::Config(_))
        ));
    }
}
