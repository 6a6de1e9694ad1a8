use anyhow::{Context, Result};
use std::path::Path;

use crate::config;
use crate::commands::bootstrap;

pub async fn file_list(config_path: &Path, limit: i64) -> Result<()> {
    let runtime = bootstrap(config::load_server_config(config_path).await?).await?;

    let files = runtime.catalog.list_files(limit).await?;
    if files.is_empty() {
        println!("No files catalogued.");
        return Ok(());
    }

    println!("{:<48} {:>14} {:<20} {}", "NAME", "SIZE", "UPLOADED", "ORIGIN");
    for file in files {
        println!(
            "{:<48} {:>14} {:<20} {}",
            file.name,
            file.size_bytes,
            file.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
            file.origin_librarian
        );
    }

    Ok(())
}

pub async fn file_info(config_path: &Path, name: &str) -> Result<()> {
    let runtime = bootstrap(config::load_server_config(config_path).await?).await?;

    let file = runtime
        .catalog
        .get_file(name)
        .await?
        .with_context(|| format!("file not found: {name}"))?;

    println!("Name:      {}", file.name);
    println!("Origin:    {}", file.origin_librarian);
    println!("Size:      {} bytes", file.size_bytes);
    println!("Checksum:  {}", file.checksum);
    println!("Uploaded:  {}", file.uploaded_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(observation_id) = file.observation_id {
        if let Some(obs) = runtime.catalog.get_observation(observation_id).await? {
            println!(
                "Observation: {} (JD {}, {}, {}s)",
                obs.id, obs.julian_date, obs.polarization, obs.length_seconds
            );
        }
    }

    let instances = runtime.catalog.instances_for_file(name).await?;
    println!("\nLocal instances ({}):", instances.len());
    for instance in instances {
        println!(
            "  {}:{} available={} policy={}",
            instance.store_name, instance.path, instance.available, instance.deletion_policy
        );
    }

    let remotes = runtime.catalog.remote_instances_for_file(name).await?;
    println!("\nRemote instances ({}):", remotes.len());
    for remote in remotes {
        println!(
            "  {} copied={} verified={}",
            remote.librarian,
            remote.copy_time.format("%Y-%m-%d %H:%M:%S"),
            remote
                .last_verified_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
    }

    Ok(())
}

pub async fn store_list(config_path: &Path) -> Result<()> {
    let runtime = bootstrap(config::load_server_config(config_path).await?).await?;

    let stores = runtime.catalog.list_stores().await?;
    println!(
        "{:<20} {:<8} {:>16} {:>16} {:<10} {}",
        "NAME", "BACKEND", "CAPACITY", "USED", "INGESTABLE", "ENABLED"
    );
    for store in stores {
        println!(
            "{:<20} {:<8} {:>16} {:>16} {:<10} {}",
            store.name,
            store.backend.to_string(),
            store.capacity_bytes,
            store.used_bytes,
            store.ingestable,
            store.enabled
        );
    }

    Ok(())
}

pub async fn queue_status(config_path: &Path) -> Result<()> {
    let runtime = bootstrap(config::load_server_config(config_path).await?).await?;

    let counts = runtime.catalog.queue_counts().await?;
    if counts.is_empty() {
        println!("Send queue is empty.");
        return Ok(());
    }

    println!("{:<10} {}", "STATUS", "COUNT");
    for (status, count) in counts {
        println!("{status:<10} {count}");
    }

    Ok(())
}
