//! Blob persistence for heatmap output: `object storage, one blob per
//! `{feed}/{run|preview}.json`` (spec §4.1). A filesystem-manifest pattern
//! (`fs::create_dir_all` + `fs::write` of pretty-printed JSON under a
//! deterministic path) stands in for the object-storage backend rather
//! than inventing a fake S3 client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Writes under a root directory, `{root}/{key}`. `key` is expected to look
/// like `{feed}/{run_id}.json` or `{feed}/preview.json`.
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create blob dir failed: {}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("write blob failed: {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read blob failed: {}", path.display())),
        }
    }
}

/// In-memory store for tests and for preview requests that don't need
/// durability.
#[derive(Default)]
pub struct InMemoryBlobStore {
    entries: Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        let store = InMemoryBlobStore::new();
        store.put("demo/run-1.json", b"{}".to_vec()).await.unwrap();
        let got = store.get("demo/run-1.json").await.unwrap();
        assert_eq!(got, Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = InMemoryBlobStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filesystem_store_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        store.put("demo/preview.json", b"hello".to_vec()).await.unwrap();
        let got = store.get("demo/preview.json").await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }
}
