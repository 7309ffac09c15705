use lantern_storage::{EvidenceRecord, ScopedEvidenceStore};

use super::Liveness;
use super::policy::{EVIDENCE_READ, EVIDENCE_WRITE};
use crate::error::{PluginError, PluginResult};

/// A plugin's view of the host evidence store, namespaced by plugin id.
///
/// Storing and deleting require `evidence.write`; loading and listing
/// require `evidence.read`.
#[derive(Debug, Clone)]
pub struct EvidenceHandle {
    store: ScopedEvidenceStore,
    can_read: bool,
    can_write: bool,
    liveness: Liveness,
}

impl EvidenceHandle {
    pub(crate) fn new(
        store: ScopedEvidenceStore,
        can_read: bool,
        can_write: bool,
        liveness: Liveness,
    ) -> Self {
        Self {
            store,
            can_read,
            can_write,
            liveness,
        }
    }

    /// Namespace all keys live under.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.store.namespace()
    }

    /// Persist an artifact.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] without `evidence.write`;
    /// [`PluginError::Storage`] if the store rejects the key or fails.
    pub async fn store(&self, key: &str, data: Vec<u8>) -> PluginResult<EvidenceRecord> {
        self.require(key, self.can_write, EVIDENCE_WRITE)?;
        Ok(self.store.store(key, data).await?)
    }

    /// Load an artifact previously stored by this plugin.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] without `evidence.read`.
    pub async fn load(&self, key: &str) -> PluginResult<Option<Vec<u8>>> {
        self.require(key, self.can_read, EVIDENCE_READ)?;
        Ok(self.store.load(key).await?)
    }

    /// Keys stored by this plugin.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] without `evidence.read`.
    pub async fn list(&self) -> PluginResult<Vec<String>> {
        self.require(self.namespace(), self.can_read, EVIDENCE_READ)?;
        Ok(self.store.list().await?)
    }

    /// Delete an artifact.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] without `evidence.write`.
    pub async fn delete(&self, key: &str) -> PluginResult<bool> {
        self.require(key, self.can_write, EVIDENCE_WRITE)?;
        Ok(self.store.delete(key).await?)
    }

    fn require(&self, resource: &str, granted: bool, permission: &str) -> PluginResult<()> {
        let resource = format!("evidence:{}/{resource}", self.namespace());
        self.liveness.check(&resource)?;
        if granted {
            Ok(())
        } else {
            Err(PluginError::denied(
                resource,
                format!("permission '{permission}' not granted"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lantern_storage::{EvidenceStore, MemoryEvidenceStore};

    use super::*;

    fn handle(
        store: &Arc<dyn EvidenceStore>,
        ns: &str,
        read: bool,
        write: bool,
    ) -> EvidenceHandle {
        EvidenceHandle::new(
            ScopedEvidenceStore::new(Arc::clone(store), ns).unwrap(),
            read,
            write,
            Liveness::default(),
        )
    }

    #[tokio::test]
    async fn permissions_gate_each_operation() {
        let store: Arc<dyn EvidenceStore> = Arc::new(MemoryEvidenceStore::new());

        let write_only = handle(&store, "com.example.a", false, true);
        write_only.store("report.json", b"{}".to_vec()).await.unwrap();
        assert!(matches!(
            write_only.load("report.json").await,
            Err(PluginError::ResourceDenied { .. })
        ));
        assert!(write_only.list().await.is_err());

        let read_only = handle(&store, "com.example.a", true, false);
        assert_eq!(
            read_only.load("report.json").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert!(read_only.store("x", Vec::new()).await.is_err());
        assert!(read_only.delete("report.json").await.is_err());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store: Arc<dyn EvidenceStore> = Arc::new(MemoryEvidenceStore::new());
        let a = handle(&store, "com.example.a", true, true);
        let b = handle(&store, "com.example.b", true, true);

        a.store("hashes.txt", b"a".to_vec()).await.unwrap();
        assert_eq!(b.load("hashes.txt").await.unwrap(), None);
        assert!(b.list().await.unwrap().is_empty());
        assert_eq!(a.list().await.unwrap(), vec!["hashes.txt"]);
    }

    #[tokio::test]
    async fn traversal_keys_fail_in_store() {
        let store: Arc<dyn EvidenceStore> = Arc::new(MemoryEvidenceStore::new());
        let a = handle(&store, "com.example.a", true, true);
        assert!(matches!(
            a.store("../com.example.b/x", Vec::new()).await,
            Err(PluginError::Storage(_))
        ));
    }
}
