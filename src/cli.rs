use crate::config::{config_file_path, load_logger_config, Interface, LoggerConfig};
use crate::errors::ConfigResult;
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};

/// Continuously log the MAX1730x register map to CSV
#[derive(Debug, Parser)]
#[command(name = "gauge-logger", version)]
pub struct Cli {
    /// Bus interface: native, bridge or simulated
    #[arg(short = 'i', long = "iface")]
    pub iface: Option<Interface>,

    /// Bus number (I2C adapter, or bridge channel 0-3)
    #[arg(short = 'b', long = "bus")]
    pub bus: Option<u32>,

    /// Output CSV file [default: max1730x_log_<date>_<time>.csv]
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Exit on the first bus error instead of logging FFFF
    #[arg(short = 'x')]
    pub exit_on_error: bool,

    /// Collection interval in seconds [default: 5.0]
    #[arg(short = 't', long = "time")]
    pub interval: Option<f64>,

    /// Configuration file [default: $CONFIG_PATH/logger.toml]
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Also log reserved registers
    #[arg(long)]
    pub keep_rsvd: bool,

    /// Read each register page with block reads
    #[arg(long)]
    pub block_reads: bool,

    /// Retries per failed read before the fault policy applies
    #[arg(long)]
    pub retries: Option<u32>,

    /// Stop after this many records
    #[arg(long)]
    pub count: Option<u64>,
}

impl Cli {
    /// File settings (or defaults when no file exists), then flags on top, validated
    pub fn load_config(&self) -> ConfigResult<LoggerConfig> {
        let mut config = match &self.config {
            Some(path) => load_logger_config(path)?,
            None => {
                let path = config_file_path();
                if path.exists() {
                    load_logger_config(&path)?
                } else {
                    debug!("[config] {} not found, using defaults", path.display());
                    LoggerConfig::default()
                }
            }
        };
        self.apply(&mut config);
        config.validate()?;
        info!(
            "[config] {} bus {}, every {} s",
            config.bus.interface, config.bus.number, config.sampling.interval_secs
        );
        Ok(config)
    }

    /// Overlay the flags that were given
    pub fn apply(&self, config: &mut LoggerConfig) {
        if let Some(iface) = self.iface {
            if iface != config.bus.interface && self.bus.is_none() {
                config.bus.number = iface.default_bus_number();
            }
            config.bus.interface = iface;
        }
        if let Some(bus) = self.bus {
            config.bus.number = bus;
        }
        if let Some(output) = &self.output {
            config.output.path = Some(output.clone());
        }
        if let Some(interval) = self.interval {
            config.sampling.interval_secs = interval;
        }
        if let Some(retries) = self.retries {
            config.sampling.retries = retries;
        }
        if let Some(count) = self.count {
            config.sampling.sample_count = Some(count);
        }
        config.sampling.exit_on_bus_error |= self.exit_on_error;
        config.sampling.include_reserved |= self.keep_rsvd;
        config.sampling.block_reads |= self.block_reads;
    }
}
