//! rsync-over-ssh backend. Staged appends and the commit rename run through
//! ssh on the remote host; bulk pushes use rsync itself.

use async_trait::async_trait;
use magpie_core::{MagpieError, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{ByteReader, StagingHandle, StoreBackend, clean_relative, staging_name};

const STAGING_DIR: &str = "staging";
const FILES_DIR: &str = "files";

pub struct RsyncStore {
    name: String,
    /// `user@host` for ssh/rsync.
    host: String,
    root: std::path::PathBuf,
    capacity_bytes: u64,
}

impl RsyncStore {
    pub fn new(name: String, host: String, root: std::path::PathBuf, capacity_bytes: u64) -> Self {
        Self {
            name,
            host,
            root,
            capacity_bytes,
        }
    }

    fn remote(&self, relative: &str) -> String {
        format!("{}/{relative}", self.root.display())
    }

    /// Run a shell script on the remote host, returning stdout.
    async fn ssh(&self, script: &str) -> Result<String> {
        let output = Command::new("ssh")
            .arg(&self.host)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(MagpieError::Io(std::io::Error::other(format!(
                "ssh {} failed ({}): {}",
                self.host,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn remote_sha256(&self, relative: &str) -> Result<String> {
        let out = self
            .ssh(&format!("sha256sum '{}'", self.remote(relative)))
            .await?;
        out.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| MagpieError::Parse(format!("unparseable sha256sum output: {out}")))
    }
}

#[async_trait]
impl StoreBackend for RsyncStore {
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
        self.ssh(&format!(
            "mkdir -p '{}' && : > '{}'",
            self.remote(STAGING_DIR),
            self.remote(&staging_path)
        ))
        .await?;

        Ok(StagingHandle {
            store: self.name.clone(),
            file_name: file_name.to_string(),
            declared_size: size,
            staging_path,
        })
    }

    async fn write(&self, handle: &StagingHandle, bytes: &[u8]) -> Result<()> {
        let mut child = Command::new("ssh")
            .arg(&self.host)
            .arg(format!("cat >> '{}'", self.remote(&handle.staging_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MagpieError::Io(std::io::Error::other("ssh stdin unavailable")))?;
        stdin.write_all(bytes).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(MagpieError::Io(std::io::Error::other(format!(
                "append over ssh to {} failed: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        Ok(())
    }

    async fn commit(
        &self,
        handle: &StagingHandle,
        expected_checksum: &str,
    ) -> Result<(String, String)> {
        let measured = self.remote_sha256(&handle.staging_path).await?;
        if measured != expected_checksum {
            self.abort(handle).await.ok();
            return Err(MagpieError::ChecksumMismatch {
                expected: expected_checksum.to_string(),
                actual: measured,
            });
        }

        let final_path = format!("{FILES_DIR}/{}", clean_relative(&handle.file_name)?);
        let target = self.remote(&final_path);
        let parent = std::path::Path::new(&target)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        self.ssh(&format!(
            "mkdir -p '{parent}' && mv '{}' '{target}'",
            self.remote(&handle.staging_path)
        ))
        .await?;

        Ok((final_path, measured))
    }

    async fn staged_size(&self, handle: &StagingHandle) -> Result<u64> {
        let out = self
            .ssh(&format!(
                "stat -c %s '{}' 2>/dev/null || echo 0",
                self.remote(&handle.staging_path)
            ))
            .await?;
        out.trim()
            .parse()
            .map_err(|_| MagpieError::Parse(format!("unparseable stat output: {out}")))
    }

    async fn abort(&self, handle: &StagingHandle) -> Result<()> {
        self.ssh(&format!("rm -f '{}'", self.remote(&handle.staging_path)))
            .await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<ByteReader> {
        let mut child = Command::new("ssh")
            .arg(&self.host)
            .arg(format!("cat '{}'", self.remote(path)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MagpieError::Io(std::io::Error::other("ssh stdout unavailable")))?;

        Ok(Box::new(stdout))
    }

    async fn checksum(&self, path: &str) -> Result<String> {
        self.remote_sha256(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ssh(&format!("rm -f '{}'", self.remote(path))).await?;
        Ok(())
    }

    async fn free_space(&self) -> Result<u64> {
        let out = self
            .ssh(&format!(
                "mkdir -p '{0}' && du -sb '{0}'",
                self.root.display()
            ))
            .await?;
        let used: u64 = out
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| MagpieError::Parse(format!("unparseable du output: {out}")))?;

        Ok(self.capacity_bytes.saturating_sub(used))
    }
}
