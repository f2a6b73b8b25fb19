// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::sync::Arc;

use hashing::Fingerprint;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{FilesystemStorage, NullStorage, Storage, StorageError};

async fn put(storage: &dyn Storage, content: &[u8]) -> String {
    let digest = Fingerprint::digest(content).to_hex();
    if let Some(mut pending) = storage.create(&digest).await.unwrap() {
        pending.file_mut().write_all(content).await.unwrap();
        storage.commit(pending, "").await.unwrap();
    }
    digest
}

async fn get(storage: &dyn Storage, digest: &str) -> Result<Vec<u8>, StorageError> {
    let mut reader = storage.get(digest).await?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    Ok(buf)
}

#[tokio::test]
async fn roundtrip() {
    let dir = TempDir::new().unwrap();
    let storage = FilesystemStorage::new(dir.path().join("storage")).unwrap();

    let digest = put(&storage, b"jelly").await;
    assert_eq!(get(&storage, &digest).await.unwrap(), b"jelly");
    assert!(storage.exists(&digest).await.unwrap());
    assert_eq!(storage.size(&digest).await.unwrap(), 5);
}

#[tokio::test]
async fn missing_digest() {
    let dir = TempDir::new().unwrap();
    let storage = FilesystemStorage::new(dir.path().join("storage")).unwrap();

    let digest = Fingerprint::digest(b"nothing here").to_hex();
    assert_eq!(
        get(&storage, &digest).await.unwrap_err(),
        StorageError::MissingDigest(digest.clone())
    );
    assert!(!storage.exists(&digest).await.unwrap());
    assert_eq!(
        storage.size(&digest).await.unwrap_err(),
        StorageError::MissingDigest(digest)
    );
}

#[tokio::test]
async fn commit_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let storage = FilesystemStorage::new(dir.path().join("storage")).unwrap();

    let first = put(&storage, b"same content").await;
    // The second create for an existing digest short-circuits.
    assert!(storage.create(&first).await.unwrap().is_none());
    assert_eq!(get(&storage, &first).await.unwrap(), b"same content");
}

#[tokio::test]
async fn delete_then_get() {
    let dir = TempDir::new().unwrap();
    let storage = FilesystemStorage::new(dir.path().join("storage")).unwrap();

    let digest = put(&storage, b"ephemeral").await;
    storage.delete(&digest).await.unwrap();
    assert!(!storage.exists(&digest).await.unwrap());
    // Deleting again is not an error.
    storage.delete(&digest).await.unwrap();
}

#[tokio::test]
async fn list_skips_temp_files() {
    let dir = TempDir::new().unwrap();
    let storage = FilesystemStorage::new(dir.path().join("storage")).unwrap();

    let a = put(&storage, b"aaa").await;
    let b = put(&storage, b"bbb").await;
    // An uncommitted pending file must not be listed.
    let pending = storage.create("cafebabe").await.unwrap().unwrap();

    let mut names: Vec<_> = storage
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    names.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(names, expected);

    drop(pending);
}

#[tokio::test]
async fn path_for_symlink() {
    let dir = TempDir::new().unwrap();
    let storage = FilesystemStorage::new(dir.path().join("storage")).unwrap();

    let digest = put(&storage, b"linked").await;
    let path = storage.path_for_symlink(&digest).unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"linked");
    assert!(storage.path_for_symlink("0000").is_none());
}

#[tokio::test]
async fn null_storage() {
    let storage = NullStorage;
    let digest = Fingerprint::digest(b"dropped").to_hex();

    // Writes are silently discarded.
    assert!(storage.create(&digest).await.unwrap().is_none());
    // Reads always miss.
    assert!(matches!(
        get(&storage, &digest).await.unwrap_err(),
        StorageError::MissingDigest(_)
    ));
    assert!(!storage.exists(&digest).await.unwrap());
    assert!(storage.list().await.unwrap().is_empty());
    assert!(storage.path_for_symlink(&digest).is_none());
}

#[tokio::test]
async fn storage_as_trait_object() {
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> =
        Arc::new(FilesystemStorage::new(dir.path().join("storage")).unwrap());
    let digest = put(storage.as_ref(), b"dyn dispatch").await;
    assert_eq!(get(storage.as_ref(), &digest).await.unwrap(), b"dyn dispatch");
}
