//! Capability sandbox.
//!
//! Builds, per plugin instance, an [`ExecutionContext`] whose brokers only
//! reach what the plugin's approved permissions allow:
//!
//! - files inside the working directory, private temp directory, and (with
//!   `evidence.read`) the evidence root
//! - outbound HTTP to category-specific domains, rate limited
//! - allow-listed external tools under a wall-clock ceiling
//! - the evidence store, namespaced by plugin id
//!
//! Every broker fails closed: an empty allow-list denies everything.

mod context;
mod evidence;
mod fs;
mod logger;
mod net;
pub mod policy;
mod process;
mod rate_limit;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lantern_storage::{EvidenceStore, ScopedEvidenceStore};
use tracing::{info, warn};
use uuid::Uuid;

pub use context::ExecutionContext;
pub use evidence::EvidenceHandle;
pub use fs::RestrictedFileAccessor;
pub use logger::{LogLevel, PluginLogger};
pub use net::{HttpRequest, HttpResponse, RestrictedHttpClient};
pub use policy::AllowedRoot;
pub use process::{ProcessOutput, RestrictedProcessInvoker};
pub use rate_limit::RateLimiter;

use crate::config::{ConfigSource, ConfigView};
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::plugin::PluginId;

/// Shared revocation flag. Set once on dispose; every broker checks it first.
#[derive(Debug, Clone, Default)]
pub(crate) struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub(crate) fn check(&self, resource: &str) -> PluginResult<()> {
        if self.is_revoked() {
            Err(PluginError::denied(resource, "execution context disposed"))
        } else {
            Ok(())
        }
    }

    /// Returns `true` for the call that performed the revocation.
    pub(crate) fn revoke(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Host-wide sandbox limits.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Each plugin gets `<temp_root>/<id>-<uuid>`.
    pub temp_root: PathBuf,
    /// Evidence root exposed read-only under `evidence.read`.
    pub evidence_root: Option<PathBuf>,
    /// Permissions the deployment is willing to grant.
    pub allowed_permissions: BTreeSet<String>,
    /// Outbound requests per plugin per minute.
    pub requests_per_minute: u32,
    /// Wall-clock ceiling per external tool run.
    pub process_timeout: Duration,
    /// Largest HTTP response body.
    pub max_http_response_bytes: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self::from_config(&lantern_config::Config::default())
    }
}

impl SandboxSettings {
    /// Settings from the `[plugins]`, `[sandbox]` and `[evidence]` sections.
    #[must_use]
    pub fn from_config(config: &lantern_config::Config) -> Self {
        Self {
            temp_root: config
                .sandbox
                .temp_root
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("lantern").join("sandbox")),
            evidence_root: config.evidence.root.clone(),
            allowed_permissions: config.plugins.allowed_permissions.iter().cloned().collect(),
            requests_per_minute: config.sandbox.requests_per_minute,
            process_timeout: Duration::from_secs(config.sandbox.process_timeout_secs),
            max_http_response_bytes: config.sandbox.max_http_response_bytes,
        }
    }

    /// Use a different temp root.
    #[must_use]
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = root.into();
        self
    }

    /// Expose an evidence root.
    #[must_use]
    pub fn with_evidence_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.evidence_root = Some(root.into());
        self
    }

    /// Replace the allowed permission set.
    #[must_use]
    pub fn with_allowed_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-plugin request ceiling.
    #[must_use]
    pub fn with_requests_per_minute(mut self, limit: u32) -> Self {
        self.requests_per_minute = limit;
        self
    }

    /// Set the tool wall-clock ceiling.
    #[must_use]
    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }
}

/// Builds execution contexts.
#[derive(Clone)]
pub struct CapabilitySandbox {
    settings: SandboxSettings,
    evidence: Arc<dyn EvidenceStore>,
    config: Arc<dyn ConfigSource>,
}

impl CapabilitySandbox {
    /// Sandbox over the host evidence store and configuration source.
    #[must_use]
    pub fn new(
        settings: SandboxSettings,
        evidence: Arc<dyn EvidenceStore>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            settings,
            evidence,
            config,
        }
    }

    /// Limits in force.
    #[must_use]
    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Build the context for `manifest`, rooted at `working_dir`.
    ///
    /// Creates the plugin's private temp directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp directory cannot be created or a broker
    /// cannot be constructed. Nothing is left on disk in that case.
    pub async fn build_context(
        &self,
        manifest: &PluginManifest,
        working_dir: &Path,
    ) -> PluginResult<ExecutionContext> {
        let plugin_id = manifest.id.clone();
        let approved =
            policy::approved_permissions(&manifest.permissions, &self.settings.allowed_permissions);

        let temp_dir = self
            .settings
            .temp_root
            .join(format!("{plugin_id}-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&temp_dir).await?;

        match self.assemble(manifest, working_dir, &temp_dir, approved) {
            Ok(ctx) => {
                info!(
                    plugin_id = %plugin_id,
                    permissions = ?ctx.approved,
                    file_roots = ctx.files.roots().len(),
                    domains = ctx.network.allowed_domains().len(),
                    programs = ctx.processes.allowed_programs().len(),
                    "Built execution context"
                );
                Ok(ctx)
            },
            Err(e) => {
                remove_temp_dir(&plugin_id, &temp_dir).await;
                Err(e)
            },
        }
    }

    fn assemble(
        &self,
        manifest: &PluginManifest,
        working_dir: &Path,
        temp_dir: &Path,
        approved: BTreeSet<String>,
    ) -> PluginResult<ExecutionContext> {
        let liveness = Liveness::default();
        let plugin_id = manifest.id.clone();

        let roots = policy::file_allow_list(
            &approved,
            working_dir,
            temp_dir,
            self.settings.evidence_root.as_deref(),
        );
        let files = RestrictedFileAccessor::new(roots, working_dir.to_path_buf(), liveness.clone());

        let network = RestrictedHttpClient::new(
            policy::domain_allow_list(manifest.category.as_deref(), &approved),
            Arc::new(RateLimiter::per_minute(self.settings.requests_per_minute)),
            self.settings.max_http_response_bytes,
            liveness.clone(),
        )?;

        let processes = RestrictedProcessInvoker::new(
            policy::executable_allow_list(&approved),
            working_dir.to_path_buf(),
            self.settings.process_timeout,
            liveness.clone(),
        );

        let evidence = EvidenceHandle::new(
            ScopedEvidenceStore::new(Arc::clone(&self.evidence), plugin_id.as_str())?,
            approved.contains(policy::EVIDENCE_READ),
            approved.contains(policy::EVIDENCE_WRITE),
            liveness.clone(),
        );

        Ok(ExecutionContext {
            logger: PluginLogger::new(plugin_id.clone()),
            config: ConfigView::new(plugin_id.clone(), Arc::clone(&self.config), liveness.clone()),
            plugin_id,
            approved,
            working_dir: working_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            files,
            network,
            processes,
            evidence,
            liveness,
        })
    }
}

/// Remove a plugin's private temp directory, logging anything but absence.
pub(crate) async fn remove_temp_dir(plugin_id: &PluginId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(
            plugin_id = %plugin_id,
            temp_dir = %dir.display(),
            error = %e,
            "Failed to remove plugin temp directory"
        ),
    }
}

impl std::fmt::Debug for CapabilitySandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitySandbox")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
