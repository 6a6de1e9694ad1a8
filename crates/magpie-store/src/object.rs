//! HTTP object-endpoint backend. Staged chunks accumulate locally and land
//! remotely in a single PUT at commit, so the remote side never sees a
//! partial object.

use async_trait::async_trait;
use futures::TryStreamExt;
use magpie_core::checksum::sha256_hex;
use magpie_core::{MagpieError, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;

use crate::{ByteReader, StagingHandle, StoreBackend, clean_relative, staging_name};

const FILES_DIR: &str = "files";

pub struct ObjectStore {
    name: String,
    endpoint: String,
    capacity_bytes: u64,
    client: reqwest::Client,
    /// Staged bytes waiting for commit, keyed by staging path.
    staged: Mutex<HashMap<String, Vec<u8>>>,
}

impl ObjectStore {
    pub fn new(name: String, endpoint: String, capacity_bytes: u64) -> Self {
        Self {
            name,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            capacity_bytes,
            client: reqwest::Client::new(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, relative: &str) -> String {
        format!("{}/{relative}", self.endpoint)
    }
}

#[async_trait]
impl StoreBackend for ObjectStore {
    async fn stage(&self, file_name: &str, size: u64) -> Result<StagingHandle> {
        clean_relative(file_name)?;

        if size > self.capacity_bytes {
            return Err(MagpieError::CapacityExceeded {
                store: self.name.clone(),
                needed: size,
                available: self.capacity_bytes,
            });
        }

        let staging_path = format!("staging/{}", staging_name(file_name));
        self.staged
            .lock()
            .await
            .insert(staging_path.clone(), Vec::with_capacity(size as usize));

        Ok(StagingHandle {
            store: self.name.clone(),
            file_name: file_name.to_string(),
            declared_size: size,
            staging_path,
        })
    }

    async fn write(&self, handle: &StagingHandle, bytes: &[u8]) -> Result<()> {
        let mut staged = self.staged.lock().await;
        let buffer = staged.get_mut(&handle.staging_path).ok_or_else(|| {
            MagpieError::Io(std::io::Error::other(format!(
                "no staged write at {}",
                handle.staging_path
            )))
        })?;
        buffer.extend_from_slice(bytes);
        Ok(())
    }

    async fn commit(
        &self,
        handle: &StagingHandle,
        expected_checksum: &str,
    ) -> Result<(String, String)> {
        let buffer = self
            .staged
            .lock()
            .await
            .remove(&handle.staging_path)
            .ok_or_else(|| {
                MagpieError::Io(std::io::Error::other(format!(
                    "no staged write at {}",
                    handle.staging_path
                )))
            })?;

        let measured = sha256_hex(&buffer);
        if measured != expected_checksum {
            return Err(MagpieError::ChecksumMismatch {
                expected: expected_checksum.to_string(),
                actual: measured,
            });
        }

        let final_path = format!("{FILES_DIR}/{}", clean_relative(&handle.file_name)?);
        let response = self
            .client
            .put(self.url(&final_path))
            .body(buffer)
            .send()
            .await
            .map_err(|e| MagpieError::Io(std::io::Error::other(e.to_string())))?;

        if !response.status().is_success() {
            return Err(MagpieError::Io(std::io::Error::other(format!(
                "object endpoint rejected PUT {final_path}: {}",
                response.status()
            ))));
        }

        Ok((final_path, measured))
    }

    async fn staged_size(&self, handle: &StagingHandle) -> Result<u64> {
        let staged = self.staged.lock().await;
        Ok(staged
            .get(&handle.staging_path)
            .map(|b| b.len() as u64)
            .unwrap_or(0))
    }

    async fn abort(&self, handle: &StagingHandle) -> Result<()> {
        self.staged.lock().await.remove(&handle.staging_path);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<ByteReader> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| MagpieError::Io(std::io::Error::other(e.to_string())))?;

        if !response.status().is_success() {
            return Err(MagpieError::Io(std::io::Error::other(format!(
                "object endpoint rejected GET {path}: {}",
                response.status()
            ))));
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn checksum(&self, path: &str) -> Result<String> {
        use tokio::io::AsyncReadExt;

        let mut reader = self.read(path).await?;
        let mut hasher = magpie_core::checksum::StreamingChecksum::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hasher.finalize())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .map_err(|e| MagpieError::Io(std::io::Error::other(e.to_string())))?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(MagpieError::Io(std::io::Error::other(format!(
                "object endpoint rejected DELETE {path}: {}",
                response.status()
            ))));
        }

        Ok(())
    }

    async fn free_space(&self) -> Result<u64> {
        // The endpoint does not report usage; the catalog's accounting is
        // authoritative for object stores.
        Ok(self.capacity_bytes)
    }
}
