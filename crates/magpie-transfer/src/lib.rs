//! Transfer manager: per-transfer state machines for both directions,
//! driven against the catalog's compare-and-set transitions, plus the peer
//! RPC client they negotiate over.

use std::sync::Arc;

use magpie_core::{MagpieError, Result};
use magpie_db::Catalog;
use magpie_store::StoreManager;

mod inbound;
mod outbound;
pub mod peer;
pub mod wire;

pub use peer::{PeerClient, with_backoff};

pub struct TransferManager {
    catalog: Arc<Catalog>,
    stores: Arc<StoreManager>,
    /// This librarian's name; stamped into remote instance claims.
    self_name: String,
}

impl TransferManager {
    pub fn new(catalog: Arc<Catalog>, stores: Arc<StoreManager>, self_name: String) -> Self {
        Self {
            catalog,
            stores,
            self_name,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn stores(&self) -> &StoreManager {
        &self.stores
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// Build an RPC client for a peer out of its catalog row.
    pub async fn peer(&self, name: &str) -> Result<PeerClient> {
        let librarian = self
            .catalog
            .get_librarian(name)
            .await?
            .ok_or_else(|| MagpieError::LibrarianNotFound(name.to_string()))?;

        Ok(PeerClient::new(&librarian))
    }

    /// Recompute the on-disk digest of a file's first available instance.
    /// Serves `verify_checksum` for peers and the pre-deletion audit.
    pub async fn measure_local_checksum(&self, file_name: &str) -> Result<String> {
        let instance = self
            .catalog
            .any_available_instance(file_name)
            .await?
            .ok_or_else(|| MagpieError::InstanceNotFound(file_name.to_string()))?;

        let store = self.stores.get(&instance.store_name)?;
        store.checksum(&instance.path).await
    }
}
