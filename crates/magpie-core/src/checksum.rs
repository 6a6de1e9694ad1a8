//! SHA-256 digests over buffers, streams of chunks, and files on disk.
//! Hex-encoded digests are what the catalog stores and the wire carries.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::Result;

const CHUNK_SIZE: usize = 64 * 1024;

/// Digest a full in-memory buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Incremental hasher for byte streams arriving in chunks.
pub struct StreamingChecksum {
    hasher: Sha256,
    bytes_seen: u64,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_seen: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_seen += chunk.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for StreamingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest a file on disk without reading it into memory at once.
pub async fn file_sha256(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // sha256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut streaming = StreamingChecksum::new();
        for chunk in data.chunks(7) {
            streaming.update(chunk);
        }
        assert_eq!(streaming.bytes_seen(), data.len() as u64);
        assert_eq!(streaming.finalize(), sha256_hex(data));
    }

    #[tokio::test]
    async fn file_digest_matches_buffer_digest() {
        let dir = std::env::temp_dir().join(format!("magpie-checksum-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("sample.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(file_sha256(&path).await.unwrap(), sha256_hex(&data));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
