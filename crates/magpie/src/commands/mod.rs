pub mod admin;
pub mod background;
pub mod server;

use anyhow::{Context, Result};
use magpie_core::config::ServerConfig;
use magpie_db::Catalog;
use magpie_store::StoreManager;
use magpie_transfer::TransferManager;
use std::sync::Arc;

/// The wired-up halves every command starts from.
pub struct Runtime {
    pub config: ServerConfig,
    pub catalog: Arc<Catalog>,
    pub stores: Arc<StoreManager>,
    pub transfers: Arc<TransferManager>,
}

/// Connect to the catalog and register this site's stores and peers.
pub async fn bootstrap(config: ServerConfig) -> Result<Runtime> {
    let catalog = Arc::new(
        Catalog::connect(&config.database_url)
            .await
            .context("Failed to connect to the catalog database")?,
    );

    for store in &config.stores {
        catalog
            .register_store(
                &store.name,
                store.backend,
                &store.root.display().to_string(),
                store.capacity_bytes as i64,
                store.ingestable,
                store.enabled,
            )
            .await?;
    }

    // Self appears in the librarians table like any peer, minus a usable
    // token; inbound auth only ever matches non-empty bearer values.
    catalog
        .upsert_librarian(&config.name, &config.base_url(), "", &[])
        .await?;
    for peer in &config.peers {
        catalog
            .upsert_librarian(&peer.name, &peer.url, &peer.auth_token, &peer.transports)
            .await?;
    }

    let stores = Arc::new(StoreManager::from_configs(&config.stores)?);
    let transfers = Arc::new(TransferManager::new(
        catalog.clone(),
        stores.clone(),
        config.name.clone(),
    ));

    Ok(Runtime {
        config,
        catalog,
        stores,
        transfers,
    })
}
