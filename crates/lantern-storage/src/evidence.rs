//! Evidence store trait, in-memory backend, and namespaced view.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};

/// Maximum length of a namespace or key.
const MAX_KEY_LEN: usize = 256;

/// Metadata describing one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Namespace the artifact was stored under.
    pub namespace: String,
    /// Key within the namespace.
    pub key: String,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
    /// When the artifact was written.
    pub stored_at: DateTime<Utc>,
}

impl EvidenceRecord {
    pub(crate) fn describe(namespace: &str, key: &str, data: &[u8]) -> Self {
        Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
            sha256: hex::encode(Sha256::digest(data)),
            size: data.len() as u64,
            stored_at: Utc::now(),
        }
    }
}

/// Host evidence store.
///
/// Every operation takes an explicit namespace. Plugin code only ever reaches
/// a store through [`ScopedEvidenceStore`], which pins the namespace.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Store `data` under `namespace/key`, replacing any previous artifact.
    async fn store(&self, namespace: &str, key: &str, data: Vec<u8>)
    -> StorageResult<EvidenceRecord>;

    /// Load the artifact at `namespace/key`.
    async fn load(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// List keys stored under `namespace`, sorted.
    async fn list(&self, namespace: &str) -> StorageResult<Vec<String>>;

    /// Delete the artifact at `namespace/key`. Returns whether it existed.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;
}

/// Validate a namespace or key component.
///
/// Both end up as path components in [`FsEvidenceStore`], so separators,
/// traversal segments and control characters are rejected everywhere.
pub(crate) fn validate_component(kind: &str, value: &str) -> StorageResult<()> {
    if value.is_empty() {
        return Err(StorageError::InvalidKey(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "{kind} exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if value == "." || value == ".." {
        return Err(StorageError::InvalidKey(format!("{kind} must not be '{value}'")));
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
    {
        return Err(StorageError::InvalidKey(format!(
            "{kind} contains a forbidden character: {value}"
        )));
    }
    Ok(())
}

/// In-memory evidence store.
#[derive(Default)]
pub struct MemoryEvidenceStore {
    items: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryEvidenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of artifacts across all namespaces.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// Whether the store holds no artifacts.
    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl fmt::Debug for MemoryEvidenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEvidenceStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl EvidenceStore for MemoryEvidenceStore {
    async fn store(
        &self,
        namespace: &str,
        key: &str,
        data: Vec<u8>,
    ) -> StorageResult<EvidenceRecord> {
        validate_component("namespace", namespace)?;
        validate_component("key", key)?;
        let record = EvidenceRecord::describe(namespace, key, &data);
        self.items
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), data);
        Ok(record)
    }

    async fn load(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_component("namespace", namespace)?;
        validate_component("key", key)?;
        Ok(self
            .items
            .read()
            .await
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: &str) -> StorageResult<Vec<String>> {
        validate_component("namespace", namespace)?;
        let mut keys: Vec<String> = self
            .items
            .read()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        validate_component("namespace", namespace)?;
        validate_component("key", key)?;
        Ok(self
            .items
            .write()
            .await
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }
}

/// A view of an [`EvidenceStore`] pinned to one namespace.
#[derive(Clone)]
pub struct ScopedEvidenceStore {
    store: Arc<dyn EvidenceStore>,
    namespace: String,
}

impl ScopedEvidenceStore {
    /// Bind `store` to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if the namespace is not a valid
    /// single path component.
    pub fn new(store: Arc<dyn EvidenceStore>, namespace: impl Into<String>) -> StorageResult<Self> {
        let namespace = namespace.into();
        validate_component("namespace", &namespace)?;
        Ok(Self { store, namespace })
    }

    /// The bound namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Store an artifact in this namespace.
    ///
    /// # Errors
    ///
    /// Propagates backend and key validation errors.
    pub async fn store(&self, key: &str, data: Vec<u8>) -> StorageResult<EvidenceRecord> {
        self.store.store(&self.namespace, key, data).await
    }

    /// Load an artifact from this namespace.
    ///
    /// # Errors
    ///
    /// Propagates backend and key validation errors.
    pub async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.store.load(&self.namespace, key).await
    }

    /// List keys in this namespace.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn list(&self) -> StorageResult<Vec<String>> {
        self.store.list(&self.namespace).await
    }

    /// Delete an artifact from this namespace.
    ///
    /// # Errors
    ///
    /// Propagates backend and key validation errors.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.store.delete(&self.namespace, key).await
    }
}

impl fmt::Debug for ScopedEvidenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedEvidenceStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_load_roundtrip() {
        let store = MemoryEvidenceStore::new();
        let record = store
            .store("com.example.a", "report.json", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(record.size, 2);
        assert_eq!(
            record.sha256,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        let loaded = store.load("com.example.a", "report.json").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(b"{}".as_slice()));
    }

    #[tokio::test]
    async fn scoped_views_are_isolated() {
        let backing: Arc<dyn EvidenceStore> = Arc::new(MemoryEvidenceStore::new());
        let a = ScopedEvidenceStore::new(Arc::clone(&backing), "com.example.a").unwrap();
        let b = ScopedEvidenceStore::new(Arc::clone(&backing), "com.example.b").unwrap();

        a.store("artifact", b"from-a".to_vec()).await.unwrap();
        b.store("artifact", b"from-b".to_vec()).await.unwrap();

        assert_eq!(a.load("artifact").await.unwrap().unwrap(), b"from-a");
        assert_eq!(b.load("artifact").await.unwrap().unwrap(), b"from-b");

        assert!(b.delete("artifact").await.unwrap());
        assert_eq!(a.list().await.unwrap(), vec!["artifact".to_string()]);
        assert!(b.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let store = MemoryEvidenceStore::new();
        for key in ["", "..", "a/b", "a\\b", "ns:key"] {
            let err = store.store("ns", key, vec![]).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "key {key:?}");
        }
    }

    #[test]
    fn scoped_rejects_bad_namespace() {
        let backing: Arc<dyn EvidenceStore> = Arc::new(MemoryEvidenceStore::new());
        assert!(ScopedEvidenceStore::new(backing, "../other").is_err());
    }

    #[tokio::test]
    async fn delete_missing_returns_false() {
        let store = MemoryEvidenceStore::new();
        assert!(!store.delete("ns", "missing").await.unwrap());
        assert!(store.is_empty().await);
    }
}
