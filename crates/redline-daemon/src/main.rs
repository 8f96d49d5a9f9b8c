mod config;
mod connection;
mod server;

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::config::{Args, DaemonConfig};

/// Exit status when graceful shutdown overran its timeout.
const EXIT_SHUTDOWN_TIMEOUT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redline_daemon=info,libredline=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = match DaemonConfig::load(&args) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("invalid configuration: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match server::run(cfg).await {
        Ok(report) if report.timed_out => {
            warn!(
                stopped = report.stopped.len(),
                failures = report.failures.len(),
                "shutdown timed out"
            );
            ExitCode::from(EXIT_SHUTDOWN_TIMEOUT)
        }
        Ok(report) => {
            info!(
                stopped = report.stopped.len(),
                checkpoints = report.checkpoints.len(),
                elapsed_ms = report.elapsed_ms,
                "redline-daemon stopped"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("redline-daemon failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
