//! # RTC Sync Configuration
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [device]
//! port = "/dev/ttyUSB1"
//! baud = 115200
//! protocol = "micros"        # or "legacy-centis"
//! settle_delay_seconds = 0.5
//!
//! [broadcast]
//! duration_seconds = 0.05
//! interval_seconds = 0.05
//!
//! [sync]
//! tolerance_seconds = 0.02
//! trials_per_batch = 100
//! max_correction_rounds = 10
//! read_timeout_seconds = 1.0
//! max_trial_retries = 3
//! max_consecutive_timeouts = 5
//! ```
//!
//! ## Example: Rust Usage
//!
//! ```rust
//! use rtc_sync::config::Config;
//! let config: Config = toml::from_str("[sync]\ntolerance_seconds = 0.01\n").unwrap();
//! assert_eq!(config.sync.tolerance_seconds, 0.01);
//! assert_eq!(config.device.baud, 115200);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use rtc_shared::WireProtocol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::communication::serial::DEFAULT_BAUD;
use crate::sync::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct: device link, seeding broadcast and convergence loop.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Serial link to the RTC board.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub protocol: WireProtocol,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_seconds: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            protocol: WireProtocol::default(),
            settle_delay_seconds: default_settle_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_duration")]
    pub duration_seconds: f64,
    #[serde(default = "default_broadcast_interval")]
    pub interval_seconds: f64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            duration_seconds: default_broadcast_duration(),
            interval_seconds: default_broadcast_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SyncSettings {
    #[serde(default = "default_tolerance")]
    pub tolerance_seconds: f64,
    #[serde(default = "default_trials")]
    pub trials_per_batch: usize,
    #[serde(default = "default_max_rounds")]
    pub max_correction_rounds: u32,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: f64,
    #[serde(default = "default_trial_retries")]
    pub max_trial_retries: u32,
    #[serde(default = "default_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tolerance_seconds: default_tolerance(),
            trials_per_batch: default_trials(),
            max_correction_rounds: default_max_rounds(),
            read_timeout_seconds: default_read_timeout(),
            max_trial_retries: default_trial_retries(),
            max_consecutive_timeouts: default_consecutive_timeouts(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.device.port.trim().is_empty() {
            return invalid("device.port must not be empty".to_string());
        }
        if self.device.baud == 0 {
            return invalid("device.baud must be > 0".to_string());
        }
        for (name, value) in [
            ("device.settle_delay_seconds", self.device.settle_delay_seconds),
            ("broadcast.duration_seconds", self.broadcast.duration_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{} must be >= 0, got {}", name, value));
            }
        }
        for (name, value) in [
            ("broadcast.interval_seconds", self.broadcast.interval_seconds),
            ("sync.tolerance_seconds", self.sync.tolerance_seconds),
            ("sync.read_timeout_seconds", self.sync.read_timeout_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return invalid(format!("{} must be > 0, got {}", name, value));
            }
        }
        if self.sync.trials_per_batch == 0 {
            return invalid("sync.trials_per_batch must be > 0".to_string());
        }
        if self.sync.max_correction_rounds == 0 {
            return invalid("sync.max_correction_rounds must be > 0".to_string());
        }
        if self.sync.max_consecutive_timeouts == 0 {
            return invalid("sync.max_consecutive_timeouts must be > 0".to_string());
        }
        Ok(())
    }

    /// The session parameters this file describes.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            protocol: self.device.protocol,
            seed_duration: seconds(self.broadcast.duration_seconds),
            interval: seconds(self.broadcast.interval_seconds),
            tolerance: self.sync.tolerance_seconds,
            trials_per_batch: self.sync.trials_per_batch,
            max_correction_rounds: self.sync.max_correction_rounds,
            read_timeout: seconds(self.sync.read_timeout_seconds),
            max_trial_retries: self.sync.max_trial_retries,
            max_consecutive_timeouts: self.sync.max_consecutive_timeouts,
            settle_delay: seconds(self.device.settle_delay_seconds),
        }
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let toml_string = toml::to_string(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn default_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud() -> u32 { DEFAULT_BAUD }
fn default_settle_delay() -> f64 { 0.5 }
fn default_broadcast_duration() -> f64 { 0.05 }
fn default_broadcast_interval() -> f64 { 0.05 }
fn default_tolerance() -> f64 { 0.02 }
fn default_trials() -> usize { 100 }
fn default_max_rounds() -> u32 { 10 }
fn default_read_timeout() -> f64 { 1.0 }
fn default_trial_retries() -> u32 { 3 }
fn default_consecutive_timeouts() -> u32 { 5 }

/// Load and validate a configuration file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config = read_config(path)?;
    config.validate()?;
    Ok(config)
}

/// Parse a configuration file without validating it, for callers that still apply
/// overrides (command line flags) and validate the result themselves.
pub fn read_config(path: &str) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    let config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to parse config TOML: {}", e);
            return Err(ConfigError::Toml(e));
        }
    };
    Ok(config)
}
