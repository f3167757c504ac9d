//! PUT/GET/DELETE facade over an opaque blob store (spec §1 "deliberately
//! out of scope... the blob store for large payloads").
//!
//! The artifact store and the backup/restore surface are the only callers;
//! both address blobs by an opaque string key (`artifacts/{type}/{id}.json`
//! and similar). [`FilesystemBlobStore`] is the production adapter used
//! when no dedicated blob service is configured, grounded on the
//! workspace's file-based receipt store.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kg_error::{ErrorCode, KgError};
use tokio::sync::RwLock;
use tracing::debug;

/// PUT/GET/DELETE of opaque byte blobs by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `key`, overwriting any existing value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), KgError>;

    /// Read the bytes stored under `key`.
    ///
    /// Returns [`ErrorCode::NotFoundResource`] if the key is absent —
    /// callers map this to `MissingPayload` for artifact reads (spec §4.5).
    async fn get(&self, key: &str) -> Result<Vec<u8>, KgError>;

    /// Delete the value stored under `key`. Deleting an absent key is not
    /// an error.
    async fn delete(&self, key: &str) -> Result<(), KgError>;

    /// `true` if `key` is currently populated.
    async fn exists(&self, key: &str) -> Result<bool, KgError>;

    /// List every key currently stored under `prefix`. Used by the
    /// startup sweep that removes stale restore temp-blobs (spec §6.1).
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KgError>;
}

fn missing_key(key: &str) -> KgError {
    KgError::new(ErrorCode::NotFoundResource, format!("blob key not found: {key}"))
        .with_context("key", key)
}

/// Filesystem-backed [`BlobStore`]. Keys are treated as slash-separated
/// relative paths under `root`; parent directories are created on write.
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    /// Create a store rooted at `root`. Does not create the directory
    /// eagerly; the first `put` call creates it.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KgError> {
        if key.is_empty() || key.contains("..") {
            return Err(KgError::new(
                ErrorCode::ValidationMalformedInput,
                "blob key must be non-empty and must not contain \"..\"",
            )
            .with_context("key", key));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), KgError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                KgError::new(ErrorCode::Internal, format!("create blob dir {}", parent.display()))
                    .with_source(e)
            })?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            KgError::new(ErrorCode::Internal, format!("write blob {}", path.display())).with_source(e)
        })?;
        debug!(target: "kg_blob", key, "blob written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, KgError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing_key(key)),
            Err(e) => Err(KgError::new(ErrorCode::Internal, format!("read blob {}", path.display()))
                .with_source(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KgError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KgError::new(ErrorCode::Internal, format!("delete blob {}", path.display()))
                .with_source(e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KgError> {
        let path = self.path_for(key)?;
        Ok(path.exists())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KgError> {
        let base = self.root.join(prefix);
        let mut keys = Vec::new();
        let mut dirs = vec![base.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(
                        KgError::new(ErrorCode::Internal, format!("list blob dir {}", dir.display()))
                            .with_source(e),
                    );
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                KgError::new(ErrorCode::Internal, format!("read blob dir entry under {}", dir.display()))
                    .with_source(e)
            })? {
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    keys.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory [`BlobStore`] test double.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), KgError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, KgError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| missing_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), KgError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, KgError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KgError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Builds the type-prefixed artifact key used by the artifact store's write
/// path (spec §4.5): `artifacts/{type}/{id}.json`, or
/// `artifacts/{type}/{ontology}/{id}.json` when `ontology` is given.
#[must_use]
pub fn artifact_key(artifact_type: &str, ontology: Option<&str>, id: &str) -> String {
    match ontology {
        Some(ontology) => format!("artifacts/{artifact_type}/{ontology}/{id}.json"),
        None => format!("artifacts/{artifact_type}/{id}.json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        store.put("artifacts/report/a1.json", b"hello".to_vec()).await.unwrap();
        assert!(store.exists("artifacts/report/a1.json").await.unwrap());
        let bytes = store.get("artifacts/report/a1.json").await.unwrap();
        assert_eq!(bytes, b"hello");
        store.delete("artifacts/report/a1.json").await.unwrap();
        assert!(!store.exists("artifacts/report/a1.json").await.unwrap());
    }

    #[tokio::test]
    async fn filesystem_store_missing_key_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let err = store.get("no/such/key.json").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFoundResource);
    }

    #[tokio::test]
    async fn filesystem_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let err = store.put("../escape.json", vec![]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationMalformedInput);
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryBlobStore::new();
        store.put("k", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), vec![1, 2, 3]);
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn filesystem_store_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        store.put("restore-tmp/a.bin", vec![1]).await.unwrap();
        store.put("restore-tmp/b.bin", vec![2]).await.unwrap();
        store.put("artifacts/report/c.json", vec![3]).await.unwrap();

        let mut keys = store.list("restore-tmp").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["restore-tmp/a.bin", "restore-tmp/b.bin"]);
    }

    #[test]
    fn artifact_key_formats_with_and_without_ontology() {
        assert_eq!(artifact_key("report", None, "a1"), "artifacts/report/a1.json");
        assert_eq!(
            artifact_key("report", Some("med"), "a1"),
            "artifacts/report/med/a1.json"
        );
    }
}
