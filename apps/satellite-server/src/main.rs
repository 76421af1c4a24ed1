//! Satellite Server - standalone voice satellite daemon.
//!
//! Bridges local mic/speaker/wake-word hardware to a remote voice-assistant
//! server over the Wyoming protocol. Thin CLI shell around
//! `satellite-core`'s composition root.

mod config;

use std::process::ExitCode;

use clap::Parser;
use satellite_core::config::LogFormat;
use satellite_core::error::SatelliteError;
use satellite_core::{bootstrap_satellite, SatelliteResult};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::config::Args;

/// Exit codes per spec.md §6: clean shutdown, fatal bind failure, bad config.
const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format, args.debug);

    match run(args).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            tracing::error!(error = %err, "satellite exited with an error");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(args: Args) -> SatelliteResult<()> {
    let validated = args.into_satellite_config().validate()?;

    tracing::info!(
        mode = ?validated.mode,
        uri = %validated.config.core.uri,
        "satellite-server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let satellite = bootstrap_satellite(validated.config)?;

    tokio::select! {
        result = satellite.run() => {
            satellite.shutdown().await;
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, cleaning up");
            satellite.shutdown().await;
        }
    }
    Ok(())
}

fn exit_code_for(err: &SatelliteError) -> u8 {
    match err {
        SatelliteError::Config(_) => EXIT_CONFIG,
        _ => EXIT_FATAL,
    }
}

fn init_logging(format: LogFormat, debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "debug" } else { "info" })
    });

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }

    tracing_log::LogTracer::init().ok();
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
