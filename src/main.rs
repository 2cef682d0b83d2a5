//! PacketPony binary entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use packetpony::config;
use packetpony::listener::ListenerManager;
use packetpony::logging::MultiLogger;
use packetpony::metrics::{MetricsServer, ProxyMetrics};

/// Bound on graceful shutdown after a termination signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "packetpony", version, about = "Layer-4 TCP/UDP traffic forwarder")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/packetpony/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.server.name,
        config = %cli.config.display(),
        "packetpony starting"
    );

    let logger = match MultiLogger::new(&cfg.logging) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let metrics = Arc::new(ProxyMetrics::new());
    let mut metrics_server = MetricsServer::new(cfg.metrics.prometheus.clone(), Arc::clone(&metrics));
    if let Err(e) = metrics_server.start().await {
        error!(error = %e, "failed to start metrics server");
        return ExitCode::FAILURE;
    }

    let mut manager = match ListenerManager::new(&cfg, Arc::clone(&logger), metrics) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "failed to create listeners");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = manager.start().await {
        error!(error = %e, "failed to start listeners");
        return ExitCode::FAILURE;
    }

    info!(listeners = manager.len(), "packetpony is running");

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return ExitCode::FAILURE;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "received shutdown signal"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "received shutdown signal"),
    }

    let result = manager.graceful_shutdown(SHUTDOWN_TIMEOUT).await;
    let _ = metrics_server.stop().await;
    logger.flush();

    match result {
        Ok(()) => {
            info!("packetpony stopped gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "error during graceful shutdown");
            ExitCode::FAILURE
        }
    }
}
