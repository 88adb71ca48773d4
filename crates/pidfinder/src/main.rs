//! pidfinder - process id to workload recorder
//!
//! Runs on each node next to the container runtime and keeps a CSV record
//! of every container's init pid together with its pod and Nextflow labels.

use anyhow::{Context, Result};
use pidfinder_lib::{CsvStore, DockerRuntime, ObservationLoopBuilder, StructuredLogger};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pidfinder");

    let config = config::AgentConfig::load()?;
    config.prepare_result_dir()?;

    let destination = config.destination();
    let logger = StructuredLogger::new(&destination);
    logger.log_startup(AGENT_VERSION, &config.schema.to_string(), config.include_stopped);

    let runtime = DockerRuntime::connect().context("Failed to create container runtime client")?;
    if let Err(e) = runtime.ping().await {
        warn!(error = %e, "Container runtime not reachable yet, will keep polling");
    }

    let store = CsvStore::new(&destination).with_retry(config.retry_policy());
    let observer = ObservationLoopBuilder::new()
        .runtime(Arc::new(runtime))
        .store(store)
        .config(config.observer_config())
        .build()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut observer_handle = tokio::spawn(observer.run(shutdown_rx));

    tokio::select! {
        result = &mut observer_handle => {
            // The loop only returns on its own when the record file can't be written
            result
                .context("Observation loop panicked")?
                .context("Observation loop stopped")?;
        }
        reason = shutdown_signal() => {
            let reason = reason?;
            logger.log_shutdown(reason);
            let _ = shutdown_tx.send(());

            observer_handle
                .await
                .context("Observation loop panicked")?
                .context("Observation loop failed during shutdown")?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok("Ctrl-C received")
}
