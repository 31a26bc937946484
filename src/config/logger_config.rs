use crate::bus::bridge::mpsse;
use crate::errors::{ConfigError, ConfigResult};
use crate::registers::DeviceFamily;
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// File name pattern used when no output path is configured
pub const DEFAULT_OUTPUT_PATTERN: &str = "max1730x_log_%Y-%m-%d_%H%M%S.csv";

/// Which transport carries the I2C traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    /// Platform I2C controller, `/dev/i2c-N`
    Native,
    /// FTDI MPSSE bridge chip
    Bridge,
    /// In-process gauge behind the bridge driver
    Simulated,
}

impl Interface {
    /// `native` on Linux, `bridge` elsewhere
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            Interface::Native
        } else {
            Interface::Bridge
        }
    }

    pub fn default_bus_number(self) -> u32 {
        match self {
            Interface::Native => 6,
            Interface::Bridge | Interface::Simulated => 1,
        }
    }
}

impl FromStr for Interface {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "smbus" | "smbus2" => Ok(Interface::Native),
            "bridge" | "ftdi" => Ok(Interface::Bridge),
            "simulated" | "sim" => Ok(Interface::Simulated),
            _ => Err(ConfigError::InvalidValue {
                field: "bus.interface".into(),
                reason: format!("'{}' is not one of native, bridge, simulated", s),
            }),
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interface::Native => "native",
            Interface::Bridge => "bridge",
            Interface::Simulated => "simulated",
        })
    }
}

/// Bridge chip settings, `[bus.bridge]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub clock_hz: u32,
    /// Repetitions of each START/STOP line state
    pub hold_repeats: u8,
    pub transfer_timeout_ms: u64,
    pub usb_vendor_id: u16,
    pub usb_product_id: u16,
    pub latency_ms: u8,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            clock_hz: 100_000,
            hold_repeats: 4,
            transfer_timeout_ms: 500,
            usb_vendor_id: 0x0403,
            usb_product_id: 0x6010,
            latency_ms: 8,
        }
    }
}

/// `[bus]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub interface: Interface,
    pub number: u32,
    pub bridge: BridgeConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        let interface = Interface::platform_default();
        Self {
            interface,
            number: interface.default_bus_number(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// `[sampling]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub device: String,
    pub interval_secs: f64,
    /// Strict mode: stop at the first failed read
    pub exit_on_bus_error: bool,
    /// Extra attempts per failed read before giving up on it
    pub retries: u32,
    pub include_reserved: bool,
    pub block_reads: bool,
    /// Stop after this many rows
    pub sample_count: Option<u64>,
    pub status_interval_secs: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            device: "max1730x".to_string(),
            interval_secs: 5.0,
            exit_on_bus_error: false,
            retries: 0,
            include_reserved: false,
            block_reads: false,
            sample_count: None,
            status_interval_secs: 30,
        }
    }
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn family(&self) -> ConfigResult<DeviceFamily> {
        self.device.parse()
    }
}

/// `[output]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: Option<PathBuf>,
}

impl OutputConfig {
    /// Configured path, or a timestamped name in the working directory
    pub fn resolve_path(&self, now: DateTime<Local>) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => PathBuf::from(now.format(DEFAULT_OUTPUT_PATTERN).to_string()),
        }
    }
}

/// Root of `logger.toml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub bus: BusConfig,
    pub sampling: SamplingConfig,
    pub output: OutputConfig,
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

impl LoggerConfig {
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject settings the loop or the transports cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.sampling;
        let interval = Duration::try_from_secs_f64(s.interval_secs).ok();
        if !s.interval_secs.is_finite()
            || s.interval_secs <= 0.0
            || interval.map_or(true, |d| d.is_zero())
        {
            return Err(invalid(
                "sampling.interval_secs",
                format!("must be a positive number of seconds, got {}", s.interval_secs),
            ));
        }
        if s.status_interval_secs == 0 {
            return Err(invalid("sampling.status_interval_secs", "must be at least 1"));
        }
        if s.sample_count == Some(0) {
            return Err(invalid("sampling.sample_count", "must be at least 1 when set"));
        }
        s.family()?;

        let b = &self.bus.bridge;
        if mpsse::clock_divisor(b.clock_hz).is_none() {
            return Err(invalid(
                "bus.bridge.clock_hz",
                format!("{} Hz cannot be derived from the 60 MHz base clock", b.clock_hz),
            ));
        }
        if b.hold_repeats == 0 {
            return Err(invalid("bus.bridge.hold_repeats", "must be at least 1"));
        }
        if b.transfer_timeout_ms == 0 {
            return Err(invalid("bus.bridge.transfer_timeout_ms", "must be at least 1"));
        }
        Ok(())
    }
}

/// `$CONFIG_PATH/logger.toml`, with `CONFIG_PATH` defaulting to `config`
pub fn config_file_path() -> PathBuf {
    let dir = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&dir).join("logger.toml")
}

/// Loads config from TOML file
pub fn load_logger_config(path: &Path) -> ConfigResult<LoggerConfig> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::LoadError {
        path: path.display().to_string(),
        source,
    })?;
    LoggerConfig::from_toml(&content)
}
