// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Everything is read once at startup from TOML and handed to the controller
//! as plain values. Default path: `/etc/speedctl/config.toml`

use crate::controller::Mode;
use crate::curve::RangeTable;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/speedctl/config.toml";

pub const DEFAULT_DEVICE_NAME: &str = "USB-Enhanced-SERIAL CH9102";
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 300;
pub const DEFAULT_COMMAND: &str = "Dimmer";

pub const DEFAULT_DELAY_MS: u64 = 1100;
pub const DEFAULT_DEAD_BAND: u8 = 3;
pub const DEFAULT_MAX_STEP: u8 = 10;
pub const DEFAULT_MANUAL_SPEED: u8 = 20;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log at debug level.
    #[serde(default)]
    pub verbose: bool,

    /// Serial dimmer settings.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Control loop settings.
    #[serde(default)]
    pub control: ControlConfig,

    /// Sensor label filters.
    #[serde(default)]
    pub sensors: SensorConfig,
}

/// How to find and talk to the dimmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Substring of the port description used to locate the device.
    /// An empty string disables name matching.
    #[serde(default = "default_device_name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Substring of the USB serial number. Wins over `name` when it matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Port tried first, before any discovery.
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Bound on each serial write and line read, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Console command that reads and sets the duty.
    #[serde(default = "default_command")]
    pub command: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            serial: None,
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            command: DEFAULT_COMMAND.to_string(),
        }
    }
}

/// Control loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Tick period in milliseconds.
    #[serde(default = "default_delay")]
    pub delay_ms: u64,

    /// Bound on a sensor read or port enumeration, in milliseconds.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Duty changes smaller than this are not written.
    #[serde(default = "default_dead_band")]
    pub dead_band: u8,

    /// Largest downward duty step per tick. 0 disables the limit.
    #[serde(default = "default_max_step")]
    pub max_step: u8,

    /// Mode at startup.
    #[serde(default)]
    pub mode: Mode,

    /// Duty used in manual mode (0-100).
    #[serde(default = "default_manual_speed")]
    pub manual_speed: u8,

    /// Temperature ranges, as a TOML array of
    /// `[temp_low, temp_high, duty_low, duty_high]` or an expression string.
    #[serde(default)]
    pub temp_ranges: RangeTable,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_DELAY_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            dead_band: DEFAULT_DEAD_BAND,
            max_step: DEFAULT_MAX_STEP,
            mode: Mode::default(),
            manual_speed: DEFAULT_MANUAL_SPEED,
            temp_ranges: RangeTable::default(),
        }
    }
}

/// Which sensor labels count as CPU and GPU temperatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_cpu_filters")]
    pub cpu_filters: Vec<String>,

    #[serde(default = "default_gpu_filters")]
    pub gpu_filters: Vec<String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            cpu_filters: default_cpu_filters(),
            gpu_filters: default_gpu_filters(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the control loop can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.control.delay_ms == 0 {
            return Err(Error::InvalidConfig("control.delay_ms must be positive".into()));
        }
        if self.control.io_timeout_ms == 0 {
            return Err(Error::InvalidConfig("control.io_timeout_ms must be positive".into()));
        }
        if self.device.timeout_ms == 0 {
            return Err(Error::InvalidConfig("device.timeout_ms must be positive".into()));
        }
        if self.device.baud_rate == 0 {
            return Err(Error::InvalidConfig("device.baud_rate must be positive".into()));
        }
        if self.device.command.trim().is_empty() {
            return Err(Error::InvalidConfig("device.command must not be empty".into()));
        }
        if self.control.manual_speed > 100 {
            return Err(Error::InvalidConfig(format!(
                "control.manual_speed {} is outside 0-100",
                self.control.manual_speed
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load / Save
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)?;
    let config = Config::from_toml(&contents)?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to a TOML file, creating parent directories if needed.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_device_name() -> Option<String> {
    Some(DEFAULT_DEVICE_NAME.to_string())
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_command() -> String {
    DEFAULT_COMMAND.to_string()
}

fn default_delay() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_io_timeout() -> u64 {
    DEFAULT_IO_TIMEOUT_MS
}

fn default_dead_band() -> u8 {
    DEFAULT_DEAD_BAND
}

fn default_max_step() -> u8 {
    DEFAULT_MAX_STEP
}

fn default_manual_speed() -> u8 {
    DEFAULT_MANUAL_SPEED
}

fn default_cpu_filters() -> Vec<String> {
    ["coretemp", "k10temp", "zenpower"].map(String::from).to_vec()
}

fn default_gpu_filters() -> Vec<String> {
    ["amdgpu", "nouveau", "radeon"].map(String::from).to_vec()
}
