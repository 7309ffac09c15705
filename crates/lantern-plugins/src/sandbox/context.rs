use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::Liveness;
use super::evidence::EvidenceHandle;
use super::fs::RestrictedFileAccessor;
use super::logger::PluginLogger;
use super::net::RestrictedHttpClient;
use super::process::RestrictedProcessInvoker;
use crate::config::ConfigView;
use crate::plugin::PluginId;

/// Everything a plugin instance may touch, scoped to its approved
/// permissions.
///
/// Owned by exactly one plugin instance. After [`dispose`](Self::dispose)
/// every broker refuses with `ResourceDenied("execution context
/// disposed")`, including clones handed out earlier.
pub struct ExecutionContext {
    pub(super) plugin_id: PluginId,
    pub(super) approved: BTreeSet<String>,
    pub(super) working_dir: PathBuf,
    pub(super) temp_dir: PathBuf,
    pub(super) logger: PluginLogger,
    pub(super) config: ConfigView,
    pub(super) files: RestrictedFileAccessor,
    pub(super) network: RestrictedHttpClient,
    pub(super) processes: RestrictedProcessInvoker,
    pub(super) evidence: EvidenceHandle,
    pub(super) liveness: Liveness,
}

impl ExecutionContext {
    /// Plugin this context belongs to.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Approved permissions.
    #[must_use]
    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.approved
    }

    /// Whether `permission` was approved.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.approved.contains(permission)
    }

    /// The plugin's private working directory (unpacked package).
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The plugin's private temp directory.
    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Scoped logger.
    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// Read-only configuration.
    #[must_use]
    pub fn config(&self) -> &ConfigView {
        &self.config
    }

    /// Restricted file accessor.
    #[must_use]
    pub fn files(&self) -> &RestrictedFileAccessor {
        &self.files
    }

    /// Restricted HTTP client.
    #[must_use]
    pub fn network(&self) -> &RestrictedHttpClient {
        &self.network
    }

    /// Restricted process invoker.
    #[must_use]
    pub fn processes(&self) -> &RestrictedProcessInvoker {
        &self.processes
    }

    /// Namespaced evidence store.
    #[must_use]
    pub fn evidence(&self) -> &EvidenceHandle {
        &self.evidence
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.liveness.is_revoked()
    }

    /// Revoke every broker and remove the private temp directory.
    /// Idempotent.
    pub async fn dispose(&self) {
        if !self.liveness.revoke() {
            return;
        }
        super::remove_temp_dir(&self.plugin_id, &self.temp_dir).await;
        debug!(plugin_id = %self.plugin_id, "Execution context disposed");
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("plugin_id", &self.plugin_id)
            .field("approved", &self.approved)
            .field("working_dir", &self.working_dir)
            .field("temp_dir", &self.temp_dir)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
