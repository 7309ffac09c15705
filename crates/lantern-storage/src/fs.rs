//! Directory-backed evidence store.
//!
//! Layout: `<root>/<namespace>/<key>`. Writes go to a sibling temp file first
//! and are renamed into place so readers never observe a partial artifact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageResult;
use crate::evidence::{EvidenceRecord, EvidenceStore, validate_component};

/// Evidence store rooted at a host directory.
#[derive(Debug, Clone)]
pub struct FsEvidenceStore {
    root: PathBuf,
}

impl FsEvidenceStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the root directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, namespace: &str, key: &str) -> StorageResult<PathBuf> {
        validate_component("namespace", namespace)?;
        validate_component("key", key)?;
        Ok(self.root.join(namespace).join(key))
    }
}

#[async_trait]
impl EvidenceStore for FsEvidenceStore {
    async fn store(
        &self,
        namespace: &str,
        key: &str,
        data: Vec<u8>,
    ) -> StorageResult<EvidenceRecord> {
        let path = self.artifact_path(namespace, key)?;
        let dir = self.root.join(namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let record = EvidenceRecord::describe(namespace, key, &data);
        let staging = dir.join(format!(".{key}.partial"));
        tokio::fs::write(&staging, &data).await?;
        tokio::fs::rename(&staging, &path).await?;

        debug!(namespace, key, size = record.size, "Stored evidence artifact");
        Ok(record)
    }

    async fn load(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.artifact_path(namespace, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str) -> StorageResult<Vec<String>> {
        validate_component("namespace", namespace)?;
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(".partial") {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let path = self.artifact_path(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_under_namespace_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsEvidenceStore::open(tmp.path().join("evidence")).await.unwrap();

        store
            .store("com.example.hash", "digest.txt", b"abc".to_vec())
            .await
            .unwrap();

        let on_disk = tmp.path().join("evidence/com.example.hash/digest.txt");
        assert_eq!(std::fs::read(on_disk).unwrap(), b"abc");
        assert_eq!(
            store.list("com.example.hash").await.unwrap(),
            vec!["digest.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_namespace_lists_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsEvidenceStore::open(tmp.path()).await.unwrap();
        assert!(store.list("nobody").await.unwrap().is_empty());
        assert!(store.load("nobody", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn traversal_key_rejected_before_io() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsEvidenceStore::open(tmp.path()).await.unwrap();
        assert!(store.store("ns", "..", b"x".to_vec()).await.is_err());
        assert!(store.store("..", "escape", b"x".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsEvidenceStore::open(tmp.path()).await.unwrap();
        store.store("ns", "k", b"v".to_vec()).await.unwrap();
        assert!(store.delete("ns", "k").await.unwrap());
        assert!(!store.delete("ns", "k").await.unwrap());
    }
}
