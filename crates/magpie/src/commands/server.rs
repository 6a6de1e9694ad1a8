use anyhow::{Context, Result};
use magpie_core::config::ServerConfig;
use magpie_http::HttpServer;
use magpie_tasks::{LogNotifier, Scheduler, build_task};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config;
use crate::commands::bootstrap;

pub async fn init_config(config_path: &Path) -> Result<()> {
    let default_config = ServerConfig::default();
    config::save_server_config(config_path, &default_config).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nPlease review and edit the configuration before starting the librarian.");
    Ok(())
}

/// Start the ingest server, with the scheduler in-process when a background
/// config is given. A background-only deployment runs `magpie background`
/// elsewhere and omits it here.
pub async fn run(config_path: &Path, background_path: Option<&Path>) -> Result<()> {
    info!("Starting magpie librarian...");

    let server_config = config::load_server_config(config_path)
        .await
        .context("Failed to load configuration")?;
    info!("Configuration loaded from {}", config_path.display());

    let runtime = bootstrap(server_config).await?;
    info!(
        librarian = %runtime.config.name,
        stores = runtime.config.stores.len(),
        peers = runtime.config.peers.len(),
        "catalog connected"
    );

    let scheduler_handle = match background_path {
        Some(path) => {
            let background = config::load_background_config(path).await?;
            let mut scheduler = Scheduler::new(
                runtime.catalog.clone(),
                runtime.stores.clone(),
                runtime.transfers.clone(),
                Arc::new(LogNotifier),
            );
            for spec in &background.tasks {
                scheduler.register(build_task(spec));
            }
            info!(tasks = scheduler.task_count(), "background scheduler enabled");
            Some(tokio::spawn(scheduler.run()))
        }
        None => {
            info!("background scheduler disabled; run `magpie background` elsewhere");
            None
        }
    };

    let http_server = HttpServer::new(
        runtime.catalog.clone(),
        runtime.stores.clone(),
        runtime.transfers.clone(),
        runtime.config.clone(),
    );
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    info!("magpie is running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    http_handle.abort();

    Ok(())
}
