//! MAX1730x fuel-gauge register logger.
//!
//! Reads the full register map over native I2C or an FTDI MPSSE bridge on a
//! fixed cadence and appends one CSV row per sweep.

pub mod bus;
pub mod cli;
pub mod config;
pub mod errors;
pub mod fault;
pub mod registers;
pub mod scheduler;
pub mod sink;

use crate::bus::open_transport;
use crate::config::LoggerConfig;
use crate::errors::{LoggerError, LoggerResult};
use crate::registers::RegisterMap;
use crate::scheduler::{probe, LoopReport, LoopSettings, SamplingLoop};
use crate::sink::CsvSink;
use chrono::Local;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// stderr logging; `RUST_LOG` overrides the `info` default
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Open the bus, check the device answers, create the log and sample until
/// `shutdown` turns true or the loop ends on its own.
pub async fn run_logger(
    config: LoggerConfig,
    shutdown: watch::Receiver<bool>,
) -> LoggerResult<LoopReport> {
    config.validate()?;
    let map = RegisterMap::for_family(config.sampling.family()?, config.sampling.include_reserved);
    info!("[main] {} registers per record", map.len());

    let mut transport = open_transport(&config.bus)?;
    let path = config.output.resolve_path(Local::now());
    let opened = match probe(transport.as_mut(), &map).await {
        Ok(()) => CsvSink::create(&path).map_err(LoggerError::from),
        Err(e) => Err(e),
    };
    let sink = match opened {
        Ok(sink) => sink,
        Err(e) => {
            if let Err(close_err) = transport.close() {
                warn!("[main] closing {} failed: {}", transport.name(), close_err);
            }
            return Err(e);
        }
    };
    info!("[main] logging to {}", path.display());

    let settings = LoopSettings::from_config(&config.sampling);
    let mut sampler = SamplingLoop::new(transport, sink, map, settings, shutdown);
    sampler.run().await
}
