use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sshtunneld::config::{self, ServiceConfig};
use sshtunneld::control::ControlServer;
use sshtunneld::manager::Manager;
use sshtunneld::storage::Storage;

/// SSH tunnel management service.
#[derive(Parser, Debug)]
#[command(name = "sshtunneld", version, about)]
struct Cli {
    /// Path to config file (default: ~/.config/sshtunneld/config.toml).
    /// Also settable via SSHTUNNELD_CONFIG env var.
    #[arg(long, global = true, env = "SSHTUNNELD_CONFIG")]
    config: Option<String>,

    /// Override the control interface listen address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut service_config = config::load_with_override(cli.config.as_deref())
        .context("failed to load service configuration")?;
    if let Some(listen) = cli.listen {
        service_config.listen_address = listen;
    }

    init_tracing(service_config.debug);
    run(service_config).await
}

async fn run(service_config: ServiceConfig) -> Result<()> {
    let storage = Storage::connect(&service_config.storage_path)
        .await
        .with_context(|| format!("failed to open storage at {}", service_config.storage_path.display()))?;

    let manager = Manager::new(Some(Arc::new(storage)));
    manager
        .load_from_storage()
        .await
        .context("failed to load tunnels from storage")?;

    let control = ControlServer::spawn(&service_config.listen_address, Arc::clone(&manager))
        .await
        .context("failed to start control interface")?;

    tracing::info!(listen_address = %service_config.listen_address, "sshtunneld started");

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");

    control.shutdown().await;
    manager.shutdown().await.context("error during tunnel shutdown")?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
