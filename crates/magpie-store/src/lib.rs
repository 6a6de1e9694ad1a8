//! Store manager: named storage backends behind one contract.
//!
//! A store stages bytes under a UUID-suffixed path, then commits them to
//! their final location atomically with a checksum measurement. `abort` and
//! `delete` are always safe to repeat. Callers never branch on backend kind
//! beyond construction.

use async_trait::async_trait;
use magpie_core::config::StoreConfig;
use magpie_core::{MagpieError, Result, StoreBackendKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

mod local;
mod object;
mod rsync;

pub use local::LocalStore;
pub use object::ObjectStore;
pub use rsync::RsyncStore;

const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// An in-flight staged write. Reconstructable from its fields, so a staging
/// location recorded in the catalog can be resumed after a restart.
#[derive(Debug, Clone)]
pub struct StagingHandle {
    pub store: String,
    pub file_name: String,
    pub declared_size: u64,
    /// Backend-specific staging location, relative to the store.
    pub staging_path: String,
}

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// The contract every backend provides.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Reserve a staging location for `size` declared bytes. Fails with
    /// `CapacityExceeded` when the store cannot hold them.
    async fn stage(&self, file_name: &str, size: u64) -> Result<StagingHandle>;

    /// Append a chunk to the staged bytes.
    async fn write(&self, handle: &StagingHandle, bytes: &[u8]) -> Result<()>;

    /// Promote staged bytes to their final path. Atomic with respect to
    /// readers: either the full file appears with a matching measured
    /// checksum, or nothing appears. Returns (final path, measured digest).
    async fn commit(&self, handle: &StagingHandle, expected_checksum: &str)
    -> Result<(String, String)>;

    /// Bytes staged so far, for deciding whether a push has finished.
    async fn staged_size(&self, handle: &StagingHandle) -> Result<u64>;

    /// Drop staged bytes. Safe to call whether or not anything was written.
    async fn abort(&self, handle: &StagingHandle) -> Result<()>;

    async fn read(&self, path: &str) -> Result<ByteReader>;

    async fn checksum(&self, path: &str) -> Result<String>;

    /// Idempotent delete of a committed path.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn free_space(&self) -> Result<u64>;
}

/// One named store: its configuration plus the backend doing the I/O.
pub struct Store {
    config: StoreConfig,
    backend: Box<dyn StoreBackend>,
}

impl Store {
    pub fn new(config: StoreConfig) -> Result<Self> {
        let backend: Box<dyn StoreBackend> = match config.backend {
            StoreBackendKind::Local => Box::new(LocalStore::new(
                config.name.clone(),
                config.root.clone(),
                config.capacity_bytes,
            )),
            StoreBackendKind::Rsync => {
                let host = config.ssh_host.clone().ok_or_else(|| {
                    MagpieError::InvalidConfig(format!(
                        "store {} uses the rsync backend but has no ssh_host",
                        config.name
                    ))
                })?;
                Box::new(RsyncStore::new(
                    config.name.clone(),
                    host,
                    config.root.clone(),
                    config.capacity_bytes,
                ))
            }
            StoreBackendKind::Object => {
                let endpoint = config.endpoint.clone().ok_or_else(|| {
                    MagpieError::InvalidConfig(format!(
                        "store {} uses the object backend but has no endpoint",
                        config.name
                    ))
                })?;
                Box::new(ObjectStore::new(
                    config.name.clone(),
                    endpoint,
                    config.capacity_bytes,
                ))
            }
        };

        Ok(Self { config, backend })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn stage(&self, file_name: &str, size: u64) -> Result<StagingHandle> {
        self.backend.stage(file_name, size).await
    }

    pub async fn write(&self, handle: &StagingHandle, bytes: &[u8]) -> Result<()> {
        self.backend.write(handle, bytes).await
    }

    pub async fn commit(
        &self,
        handle: &StagingHandle,
        expected_checksum: &str,
    ) -> Result<(String, String)> {
        self.backend.commit(handle, expected_checksum).await
    }

    pub async fn staged_size(&self, handle: &StagingHandle) -> Result<u64> {
        self.backend.staged_size(handle).await
    }

    pub async fn abort(&self, handle: &StagingHandle) -> Result<()> {
        self.backend.abort(handle).await
    }

    pub async fn read(&self, path: &str) -> Result<ByteReader> {
        self.backend.read(path).await
    }

    pub async fn checksum(&self, path: &str) -> Result<String> {
        self.backend.checksum(path).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.backend.delete(path).await
    }

    pub async fn free_space(&self) -> Result<u64> {
        self.backend.free_space().await
    }
}

/// All configured stores, addressable by name.
pub struct StoreManager {
    stores: HashMap<String, Arc<Store>>,
}

impl StoreManager {
    pub fn from_configs(configs: &[StoreConfig]) -> Result<Self> {
        let mut stores = HashMap::new();
        for config in configs {
            let store = Store::new(config.clone())?;
            if stores.insert(config.name.clone(), Arc::new(store)).is_some() {
                return Err(MagpieError::InvalidConfig(format!(
                    "duplicate store name: {}",
                    config.name
                )));
            }
        }
        Ok(Self { stores })
    }

    pub fn get(&self, name: &str) -> Result<Arc<Store>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| MagpieError::StoreNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Stream a committed file from one store into a fresh staged write on
/// another, then commit it there. Returns the destination (path, digest).
pub async fn copy_between(
    source: &Store,
    source_path: &str,
    destination: &Store,
    file_name: &str,
    size: u64,
    expected_checksum: &str,
) -> Result<(String, String)> {
    let handle = destination.stage(file_name, size).await?;
    let mut reader = match source.read(source_path).await {
        Ok(reader) => reader,
        Err(e) => {
            destination.abort(&handle).await.ok();
            return Err(e);
        }
    };

    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                destination.abort(&handle).await.ok();
                return Err(e.into());
            }
        };
        if n == 0 {
            break;
        }
        if let Err(e) = destination.write(&handle, &buf[..n]).await {
            destination.abort(&handle).await.ok();
            return Err(e);
        }
    }

    match destination.commit(&handle, expected_checksum).await {
        Ok(committed) => Ok(committed),
        Err(e) => {
            destination.abort(&handle).await.ok();
            Err(e)
        }
    }
}

/// Reject absolute paths and parent traversal in file names used as store
/// paths. Returns the cleaned relative path.
pub(crate) fn clean_relative(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(MagpieError::Parse("empty file name".to_string()));
    }
    let path = std::path::Path::new(name);
    if path.is_absolute() {
        return Err(MagpieError::Parse(format!("absolute file name: {name}")));
    }
    for component in path.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => {
                return Err(MagpieError::Parse(format!(
                    "file name escapes the store root: {name}"
                )));
            }
        }
    }
    Ok(name.to_string())
}

/// Basename used in staging paths; the UUID prefix carries the uniqueness.
pub(crate) fn staging_name(file_name: &str) -> String {
    let base = std::path::Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    format!("{}-{}", uuid::Uuid::new_v4(), base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_relative_accepts_nested_names() {
        assert_eq!(clean_relative("2456789/f1.uvh5").unwrap(), "2456789/f1.uvh5");
    }

    #[test]
    fn clean_relative_rejects_escapes() {
        assert!(clean_relative("/etc/passwd").is_err());
        assert!(clean_relative("../outside").is_err());
        assert!(clean_relative("a/../../b").is_err());
        assert!(clean_relative("").is_err());
    }

    #[test]
    fn staging_names_are_unique_per_call() {
        let a = staging_name("obs/f1.uvh5");
        let b = staging_name("obs/f1.uvh5");
        assert_ne!(a, b);
        assert!(a.ends_with("-f1.uvh5"));
    }
}
