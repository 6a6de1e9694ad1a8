//! Local store backend integration tests: staging, commit atomicity,
//! abort, idempotent delete, and capacity accounting.

use magpie_core::MagpieError;
use magpie_core::checksum::sha256_hex;
use magpie_store::{LocalStore, StoreBackend};
use tempfile::TempDir;

fn store_with_capacity(capacity: u64) -> (LocalStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = LocalStore::new(
        "test".to_string(),
        temp_dir.path().to_path_buf(),
        capacity,
    );
    (store, temp_dir)
}

#[tokio::test]
async fn stage_write_commit_round_trip() {
    let (store, temp_dir) = store_with_capacity(1 << 20);
    let data = b"observation bytes, chunked";
    let digest = sha256_hex(data);

    let handle = store.stage("obs/f1.uvh5", data.len() as u64).await.unwrap();
    for chunk in data.chunks(5) {
        store.write(&handle, chunk).await.unwrap();
    }

    let (path, measured) = store.commit(&handle, &digest).await.unwrap();
    assert_eq!(path, "files/obs/f1.uvh5");
    assert_eq!(measured, digest);

    let on_disk = std::fs::read(temp_dir.path().join(&path)).unwrap();
    assert_eq!(on_disk, data);

    // Staging file is gone after commit.
    let staging: Vec<_> = std::fs::read_dir(temp_dir.path().join("staging"))
        .unwrap()
        .collect();
    assert!(staging.is_empty());

    assert_eq!(store.checksum(&path).await.unwrap(), digest);
}

#[tokio::test]
async fn commit_with_wrong_checksum_leaves_nothing() {
    let (store, temp_dir) = store_with_capacity(1 << 20);
    let data = b"tampered in flight";

    let handle = store.stage("f1", data.len() as u64).await.unwrap();
    store.write(&handle, data).await.unwrap();

    let err = store
        .commit(&handle, &sha256_hex(b"what the sender promised"))
        .await
        .unwrap_err();
    assert!(matches!(err, MagpieError::ChecksumMismatch { .. }));

    // Neither the final path nor the staging bytes survive.
    assert!(!temp_dir.path().join("files/f1").exists());
    let staging: Vec<_> = std::fs::read_dir(temp_dir.path().join("staging"))
        .unwrap()
        .collect();
    assert!(staging.is_empty());
}

#[tokio::test]
async fn commit_with_short_write_fails() {
    let (store, temp_dir) = store_with_capacity(1 << 20);
    let data = b"only half arrives";

    let handle = store.stage("f1", (data.len() * 2) as u64).await.unwrap();
    store.write(&handle, data).await.unwrap();

    let err = store.commit(&handle, &sha256_hex(data)).await.unwrap_err();
    assert!(matches!(err, MagpieError::ChecksumMismatch { .. }));
    assert!(!temp_dir.path().join("files/f1").exists());
}

#[tokio::test]
async fn recommitting_same_bytes_is_idempotent() {
    let (store, _temp_dir) = store_with_capacity(1 << 20);
    let data = b"same bytes twice";
    let digest = sha256_hex(data);

    let first = store.stage("f1", data.len() as u64).await.unwrap();
    store.write(&first, data).await.unwrap();
    let (path1, _) = store.commit(&first, &digest).await.unwrap();

    let second = store.stage("f1", data.len() as u64).await.unwrap();
    store.write(&second, data).await.unwrap();
    let (path2, measured) = store.commit(&second, &digest).await.unwrap();

    assert_eq!(path1, path2);
    assert_eq!(measured, digest);
}

#[tokio::test]
async fn abort_discards_staging_without_side_effects() {
    let (store, temp_dir) = store_with_capacity(1 << 20);

    let handle = store.stage("f1", 16).await.unwrap();
    store.write(&handle, b"partial").await.unwrap();
    store.abort(&handle).await.unwrap();

    let staging: Vec<_> = std::fs::read_dir(temp_dir.path().join("staging"))
        .unwrap()
        .collect();
    assert!(staging.is_empty());
    assert!(!temp_dir.path().join("files").exists());

    // Aborting again is harmless.
    store.abort(&handle).await.unwrap();
}

#[tokio::test]
async fn stage_rejects_oversized_files() {
    let (store, _temp_dir) = store_with_capacity(100);

    let err = store.stage("f1", 1000).await.unwrap_err();
    match err {
        MagpieError::CapacityExceeded {
            store: name,
            needed,
            ..
        } => {
            assert_eq!(name, "test");
            assert_eq!(needed, 1000);
        }
        other => panic!("expected CapacityExceeded, got {other}"),
    }
}

#[tokio::test]
async fn free_space_shrinks_as_files_commit() {
    let (store, _temp_dir) = store_with_capacity(1000);
    assert_eq!(store.free_space().await.unwrap(), 1000);

    let data = [7u8; 400];
    let handle = store.stage("f1", data.len() as u64).await.unwrap();
    store.write(&handle, &data).await.unwrap();
    store.commit(&handle, &sha256_hex(&data)).await.unwrap();

    assert_eq!(store.free_space().await.unwrap(), 600);

    // A second file of 700 bytes no longer fits.
    let err = store.stage("f2", 700).await.unwrap_err();
    assert!(matches!(err, MagpieError::CapacityExceeded { .. }));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (store, temp_dir) = store_with_capacity(1 << 20);
    let data = b"deletable";

    let handle = store.stage("f1", data.len() as u64).await.unwrap();
    store.write(&handle, data).await.unwrap();
    let (path, _) = store.commit(&handle, &sha256_hex(data)).await.unwrap();

    store.delete(&path).await.unwrap();
    assert!(!temp_dir.path().join(&path).exists());
    store.delete(&path).await.unwrap();
}

#[tokio::test]
async fn read_streams_committed_bytes() {
    use tokio::io::AsyncReadExt;

    let (store, _temp_dir) = store_with_capacity(1 << 20);
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 249) as u8).collect();

    let handle = store.stage("big.bin", data.len() as u64).await.unwrap();
    for chunk in data.chunks(8192) {
        store.write(&handle, chunk).await.unwrap();
    }
    let (path, _) = store.commit(&handle, &sha256_hex(&data)).await.unwrap();

    let mut reader = store.read(&path).await.unwrap();
    let mut back = Vec::new();
    reader.read_to_end(&mut back).await.unwrap();
    assert_eq!(back, data);
}
