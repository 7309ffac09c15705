//! Registry entries and the handles callers execute through.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::loader::{ModuleHandle, ModuleKind};
use crate::manifest::PluginManifest;
use crate::plugin::{Capabilities, Plugin, PluginId};
use crate::request::{PluginRequest, PluginResponse};
use crate::sandbox::ExecutionContext;

/// How long a cancelled execution gets to wind down before it is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Shared state of one loaded plugin. Outlives unload while stale
/// [`PluginHandle`]s exist, but the instance itself is taken out on unload.
pub(crate) struct LoadedPlugin {
    pub(crate) id: PluginId,
    pub(crate) manifest: Arc<PluginManifest>,
    pub(crate) capabilities: Capabilities,
    pub(crate) routed_intents: BTreeSet<String>,
    pub(crate) context: Arc<ExecutionContext>,
    pub(crate) module_kind: ModuleKind,
    pub(crate) loaded_at: DateTime<Utc>,
    pub(crate) default_timeout: Duration,
    slot: RwLock<Option<Arc<dyn Plugin>>>,
    gate: Arc<Semaphore>,
    permits: u32,
    closed: AtomicBool,
    root_cancel: CancellationToken,
}

impl LoadedPlugin {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        manifest: Arc<PluginManifest>,
        plugin: Arc<dyn Plugin>,
        capabilities: Capabilities,
        routed_intents: BTreeSet<String>,
        context: Arc<ExecutionContext>,
        module_kind: ModuleKind,
        default_timeout: Duration,
        max_concurrent: u32,
    ) -> Self {
        let permits = max_concurrent.max(1);
        Self {
            id: manifest.id.clone(),
            manifest,
            capabilities,
            routed_intents,
            context,
            module_kind,
            loaded_at: Utc::now(),
            default_timeout,
            slot: RwLock::new(Some(plugin)),
            gate: Arc::new(Semaphore::new(permits as usize)),
            permits,
            closed: AtomicBool::new(false),
            root_cancel: CancellationToken::new(),
        }
    }

    async fn acquire(&self) -> PluginResult<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| PluginError::NotLoaded(self.id.clone()))?;
        if self.closed.load(Ordering::Acquire) {
            return Err(PluginError::NotLoaded(self.id.clone()));
        }
        Ok(permit)
    }

    /// Refuse new executions and wait up to `timeout` for in-flight ones.
    /// Returns `false` if the wait timed out, after cancelling stragglers.
    pub(crate) async fn close_and_drain(&self, timeout: Duration) -> bool {
        self.closed.store(true, Ordering::Release);
        let drained = tokio::time::timeout(timeout, self.gate.acquire_many(self.permits))
            .await
            .is_ok_and(|permit| permit.is_ok());
        self.gate.close();
        if !drained {
            warn!(
                plugin_id = %self.id,
                timeout = ?timeout,
                "In-flight executions did not finish in time, cancelling"
            );
            self.root_cancel.cancel();
        }
        drained
    }

    /// Take the instance out. Later executions see `NotLoaded`.
    pub(crate) async fn take_plugin(&self) -> Option<Arc<dyn Plugin>> {
        self.slot.write().await.take()
    }

    /// Executions currently holding a permit.
    pub(crate) fn in_flight(&self) -> usize {
        if self.gate.is_closed() {
            return 0;
        }
        (self.permits as usize).saturating_sub(self.gate.available_permits())
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.id)
            .field("routed_intents", &self.routed_intents)
            .field("module_kind", &self.module_kind)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Finished(Result<PluginResult<PluginResponse>, tokio::task::JoinError>),
    TimedOut,
    Cancelled,
}

/// What the registry owns per loaded plugin.
pub(crate) struct RegistryEntry {
    pub(crate) shared: Arc<LoadedPlugin>,
    pub(crate) module: ModuleHandle,
    pub(crate) working_dir: PathBuf,
}

/// A reference to a loaded plugin.
///
/// Cheap to clone. A handle kept past unload stays valid as a value, but
/// every execution through it fails with [`PluginError::NotLoaded`].
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<LoadedPlugin>,
}

impl PluginHandle {
    pub(crate) fn new(inner: Arc<LoadedPlugin>) -> Self {
        Self { inner }
    }

    /// Plugin identity.
    #[must_use]
    pub fn id(&self) -> &PluginId {
        &self.inner.id
    }

    /// Manifest the plugin was loaded from.
    #[must_use]
    pub fn manifest(&self) -> &PluginManifest {
        &self.inner.manifest
    }

    /// Capabilities the instance declared.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Intents requests may be routed to this plugin with.
    #[must_use]
    pub fn intents(&self) -> &BTreeSet<String> {
        &self.inner.routed_intents
    }

    /// Whether requests for `intent` are routed here.
    #[must_use]
    pub fn supports_intent(&self, intent: &str) -> bool {
        self.inner.routed_intents.contains(intent)
    }

    /// Budget used when a request carries none.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// When the plugin was registered.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.inner.loaded_at
    }

    /// Whether unload has started.
    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Run one request.
    ///
    /// The budget is the request's timeout or the plugin's default. Plugin
    /// errors, panics, timeouts and cancellation all come back as a failed
    /// [`PluginResponse`], never as an error.
    ///
    /// # Errors
    ///
    /// Only [`PluginError::NotLoaded`], when the plugin has been unloaded.
    pub async fn execute(
        &self,
        request: PluginRequest,
        cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        let entry = &self.inner;
        if !entry.routed_intents.contains(&request.intent) {
            return Ok(PluginResponse::failure(format!(
                "intent '{}' is not handled by {}",
                request.intent, entry.id
            ))
            .with_metadata("errorKind", "execution_failure"));
        }

        let _permit = entry.acquire().await?;
        let plugin = entry
            .slot
            .read()
            .await
            .clone()
            .ok_or_else(|| PluginError::NotLoaded(entry.id.clone()))?;

        let budget = request.timeout().unwrap_or(entry.default_timeout);
        let intent = request.intent.clone();
        let token = entry.root_cancel.child_token();
        let call_token = token.clone();
        let started = Instant::now();

        let mut task =
            tokio::spawn(async move { plugin.execute(request, call_token).await });

        let outcome = tokio::select! {
            joined = &mut task => Outcome::Finished(joined),
            () = tokio::time::sleep(budget) => Outcome::TimedOut,
            () = cancel.cancelled() => Outcome::Cancelled,
            () = token.cancelled() => Outcome::Cancelled,
        };

        if !matches!(outcome, Outcome::Finished(_)) {
            token.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        let elapsed = started.elapsed();
        let response = match outcome {
            Outcome::Finished(Ok(Ok(response))) => {
                debug!(
                    plugin_id = %entry.id,
                    intent = %intent,
                    success = response.is_success(),
                    elapsed_ms = elapsed.as_millis(),
                    "Execution finished"
                );
                response
            },
            Outcome::Finished(Ok(Err(e))) => failed(&entry.id, &intent, &e),
            Outcome::Finished(Err(join)) => {
                let e = PluginError::ExecutionFailure(if join.is_panic() {
                    "plugin panicked during execution".to_string()
                } else {
                    format!("execution task failed: {join}")
                });
                failed(&entry.id, &intent, &e)
            },
            Outcome::TimedOut => failed(
                &entry.id,
                &intent,
                &PluginError::Timeout {
                    operation: format!("{} {intent}", entry.id),
                    after: budget,
                },
            ),
            Outcome::Cancelled => failed(
                &entry.id,
                &intent,
                &PluginError::Cancelled(format!("{} {intent}", entry.id)),
            ),
        };
        Ok(response)
    }
}

fn failed(plugin_id: &PluginId, intent: &str, error: &PluginError) -> PluginResponse {
    warn!(plugin_id = %plugin_id, intent, error = %error, "Execution failed");
    PluginResponse::failure(error.to_string()).with_metadata("errorKind", error.kind().to_string())
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.inner.id)
            .field("intents", &self.inner.routed_intents)
            .field("unloaded", &self.is_unloaded())
            .finish()
    }
}

/// Summary of a loaded plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    /// Identity.
    pub id: PluginId,
    /// Display name.
    pub name: String,
    /// Version.
    pub version: String,
    /// Declared category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Routed intents.
    pub intents: BTreeSet<String>,
    /// Approved permissions.
    pub permissions: BTreeSet<String>,
    /// Module kind.
    pub module_kind: String,
    /// Executions in progress.
    pub in_flight: usize,
    /// Registration time.
    pub loaded_at: DateTime<Utc>,
}

impl From<&LoadedPlugin> for PluginInfo {
    fn from(entry: &LoadedPlugin) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.manifest.name.clone(),
            version: entry.manifest.version.to_string(),
            category: entry.manifest.category.clone(),
            intents: entry.routed_intents.clone(),
            permissions: entry.context.permissions().clone(),
            module_kind: entry.module_kind.to_string(),
            in_flight: entry.in_flight(),
            loaded_at: entry.loaded_at,
        }
    }
}

/// Boolean outcome plus reason, for API and CLI callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    /// Whether the operation succeeded.
    pub success: bool,
    /// The plugin concerned, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<PluginId>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Failure category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<crate::error::ErrorKind>,
}

impl OperationReport {
    pub(crate) fn ok(plugin_id: PluginId) -> Self {
        Self {
            success: true,
            plugin_id: Some(plugin_id),
            reason: None,
            kind: None,
        }
    }

    pub(crate) fn failed(plugin_id: Option<PluginId>, error: &PluginError) -> Self {
        Self {
            success: false,
            plugin_id,
            reason: Some(error.to_string()),
            kind: Some(error.kind()),
        }
    }
}
