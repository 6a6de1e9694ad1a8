//! Local filesystem backend. Commit is a rename within the filesystem, so a
//! reader sees either nothing or the whole file.

use async_trait::async_trait;
use magpie_core::checksum::file_sha256;
use magpie_core::{MagpieError, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::{ByteReader, StagingHandle, StoreBackend, clean_relative, staging_name};

const STAGING_DIR: &str = "staging";
const FILES_DIR: &str = "files";

pub struct LocalStore {
    name: String,
    root: PathBuf,
    capacity_bytes: u64,
}

impl LocalStore {
    pub fn new(name: String, root: PathBuf, capacity_bytes: u64) -> Self {
        Self {
            name,
            root,
            capacity_bytes,
        }
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Bytes currently under the root, staging subtree included.
    async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }

        Ok(total)
    }
}

#[async_trait]
impl StoreBackend for LocalStore {
    async fn stage(&self, file_name: &str, size: u64) -> Result<StagingHandle> {
        clean_relative(file_name)?;

        let available = self.free_space().await?;
        if size > available {
            return Err(MagpieError::CapacityExceeded {
                store: self.name.clone(),
                needed: size,
                available,
            });
        }

        let staging_path = format!("{STAGING_DIR}/{}", staging_name(file_name));
        let absolute = self.absolute(&staging_path);
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&absolute).await?;

        Ok(StagingHandle {
            store: self.name.clone(),
            file_name: file_name.to_string(),
            declared_size: size,
            staging_path,
        })
    }

    async fn write(&self, handle: &StagingHandle, bytes: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.absolute(&handle.staging_path))
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn commit(
        &self,
        handle: &StagingHandle,
        expected_checksum: &str,
    ) -> Result<(String, String)> {
        let staging = self.absolute(&handle.staging_path);

        let measured_size = tokio::fs::metadata(&staging).await?.len();
        if measured_size != handle.declared_size {
            tokio::fs::remove_file(&staging).await.ok();
            return Err(MagpieError::ChecksumMismatch {
                expected: format!("{} bytes", handle.declared_size),
                actual: format!("{measured_size} bytes"),
            });
        }

        let measured = file_sha256(&staging).await?;
        if measured != expected_checksum {
            tokio::fs::remove_file(&staging).await.ok();
            return Err(MagpieError::ChecksumMismatch {
                expected: expected_checksum.to_string(),
                actual: measured,
            });
        }

        let final_path = format!("{FILES_DIR}/{}", clean_relative(&handle.file_name)?);
        let target = self.absolute(&final_path);

        if tokio::fs::metadata(&target).await.is_ok() {
            let existing = file_sha256(&target).await?;
            if existing == measured {
                // Same bytes already committed; nothing to do.
                tokio::fs::remove_file(&staging).await.ok();
                return Ok((final_path, measured));
            }
            tokio::fs::remove_file(&staging).await.ok();
            return Err(MagpieError::Conflict(format!(
                "{} already holds different bytes at {final_path}",
                self.name
            )));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staging, &target).await?;

        Ok((final_path, measured))
    }

    async fn staged_size(&self, handle: &StagingHandle) -> Result<u64> {
        match tokio::fs::metadata(self.absolute(&handle.staging_path)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn abort(&self, handle: &StagingHandle) -> Result<()> {
        remove_if_present(&self.absolute(&handle.staging_path)).await
    }

    async fn read(&self, path: &str) -> Result<ByteReader> {
        let file = tokio::fs::File::open(self.absolute(path)).await?;
        Ok(Box::new(file))
    }

    async fn checksum(&self, path: &str) -> Result<String> {
        file_sha256(&self.absolute(path)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        remove_if_present(&self.absolute(path)).await
    }

    async fn free_space(&self) -> Result<u64> {
        let used = self.disk_usage().await?;
        Ok(self.capacity_bytes.saturating_sub(used))
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
