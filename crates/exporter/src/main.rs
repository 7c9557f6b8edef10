//! Job metrics exporter
//!
//! Runs on each Slurm compute node, attributing GPU memory, GPU requests
//! and block I/O to jobs and serving them on `/metrics`.

use anyhow::{Context, Result};
use clap::Parser;
use exporter_lib::{
    api,
    collector::CollectionLoopBuilder,
    health::{components, HealthRegistry},
    observability::{ExporterMetrics, StructuredLogger},
    publisher::SnapshotHandle,
    sources::{NvidiaSmiSource, SqueueSource},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "job-metrics-exporter", version, about = "Per-job GPU and I/O metrics for Slurm nodes")]
struct Args {
    /// Configuration file, overridden by EXPORTER_* environment variables
    #[arg(short, long, env = "EXPORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Also write each snapshot to this node_exporter textfile
    #[arg(long)]
    textfile_output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing with JSON output and env filter
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().json())
        .init();

    let mut config = config::ExporterConfig::load(args.config.as_deref())?;
    if args.textfile_output.is_some() {
        config.textfile_path = args.textfile_output;
    }
    info!(node_name = %config.node_name, "Exporter configured");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    for component in components::ALL {
        health_registry.register(component).await;
    }

    // Register self metrics before the first scrape
    let _metrics = ExporterMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    // Bind before starting anything so a taken port fails fast
    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let snapshots = SnapshotHandle::new();
    let collection_loop = CollectionLoopBuilder::new()
        .config(config.collection_config())
        .scheduler(Arc::new(SqueueSource::new(
            &config.squeue_path,
            config.command_timeout(),
        )))
        .devices(Arc::new(NvidiaSmiSource::new(
            &config.nvidia_smi_path,
            config.command_timeout(),
        )))
        .health(health_registry.clone())
        .snapshots(snapshots.clone())
        .logger(logger.clone())
        .build()?;

    logger.log_startup(EXPORTER_VERSION, config.listen_port);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let loop_handle = tokio::spawn(collection_loop.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(health_registry, snapshots));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(listener, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    if let Err(e) = loop_handle.await {
        error!(error = %e, "Collection loop task failed");
    }
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}
