use anyhow::{Context, Result};
use magpie_tasks::{LogNotifier, Scheduler, build_task};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config;
use crate::commands::bootstrap;

/// Run only the scheduler, for deployments that host background tasks in a
/// separate process from ingest.
pub async fn run(config_path: &Path, background_path: &Path) -> Result<()> {
    info!("Starting magpie background scheduler...");

    let server_config = config::load_server_config(config_path)
        .await
        .context("Failed to load configuration")?;
    let background = config::load_background_config(background_path).await?;

    let runtime = bootstrap(server_config).await?;

    let mut scheduler = Scheduler::new(
        runtime.catalog.clone(),
        runtime.stores.clone(),
        runtime.transfers.clone(),
        Arc::new(LogNotifier),
    );
    for spec in &background.tasks {
        scheduler.register(build_task(spec));
    }
    info!(
        librarian = %runtime.config.name,
        tasks = scheduler.task_count(),
        "background scheduler running; press Ctrl+C to stop"
    );

    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
