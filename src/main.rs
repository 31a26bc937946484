use clap::Parser;
use gauge_logger::cli::Cli;
use gauge_logger::{init_tracing, run_logger};
use std::process::ExitCode;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // RUST_LOG=debug for per-read diagnostics, RUST_LOG=trace for bridge transfers
    init_tracing();
    let cli = Cli::parse();

    info!("[gauge-logger] starting up...");

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("[config] {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("[main] interrupt received, finishing up");
            let _ = shutdown_tx.send(true);
        }
    });

    match run_logger(config, shutdown_rx).await {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(e) => {
            error!("[error] {}", e);
            ExitCode::FAILURE
        }
    }
}
