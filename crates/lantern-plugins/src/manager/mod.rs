//! Plugin manager: the single authority over plugin lifecycle state.
//!
//! Per identity the state machine is `Unloaded → Validating → Loading →
//! Loaded → Unloading → Unloaded`. Load and unload are serialized by one
//! manager-wide lock; executions never take it. The registry is the only
//! shared mutable state and is written only inside that critical section.
//!
//! Unload drains: the entry is detached so new lookups miss it, its gate is
//! closed so stale handles get [`PluginError::NotLoaded`], in-flight calls
//! get `plugins.drain_timeout_secs` to finish, and stragglers are cancelled
//! before teardown.

mod entry;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lantern_storage::{EvidenceStore, MemoryEvidenceStore};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::entry::{OperationReport, PluginHandle, PluginInfo};

use self::entry::{LoadedPlugin, RegistryEntry};
use crate::config::{ConfigSource, StaticConfigSource};
use crate::discovery::{self, DiscoveredPlugin};
use crate::error::{PluginError, PluginResult};
use crate::loader::{ModuleHandle, ModuleLoader, NativeModuleRegistry, ReleaseOutcome};
use crate::manifest::PluginManifest;
use crate::package::PackageArchive;
use crate::plugin::{Capabilities, Plugin, PluginId, PluginState};
use crate::sandbox::policy::NETWORK_API;
use crate::sandbox::{CapabilitySandbox, ExecutionContext, SandboxSettings};
use crate::validator::{PluginValidator, ValidationPolicy};

/// Lifecycle limits.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Default directory for discovery.
    pub plugin_dir: Option<PathBuf>,
    /// Each loaded plugin is unpacked to `<work_dir>/<id>-<uuid>`.
    pub work_dir: PathBuf,
    /// Budget for `initialize`, `validate` and `dispose` hooks.
    pub initialize_timeout: Duration,
    /// How long unload waits for in-flight executions.
    pub drain_timeout: Duration,
    /// Concurrent executions per plugin.
    pub max_concurrent_executions: u32,
    /// Execution budget when neither request nor plugin sets one.
    pub default_execution_timeout: Duration,
    /// WASM linear-memory cap.
    pub wasm_max_memory_bytes: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&lantern_config::Config::default())
    }
}

impl ManagerSettings {
    /// Settings from the `[plugins]` and `[sandbox]` sections.
    #[must_use]
    pub fn from_config(config: &lantern_config::Config) -> Self {
        Self {
            plugin_dir: config.plugins.directory.clone(),
            work_dir: config
                .plugins
                .work_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("lantern").join("work")),
            initialize_timeout: Duration::from_secs(config.plugins.initialize_timeout_secs),
            drain_timeout: Duration::from_secs(config.plugins.drain_timeout_secs),
            max_concurrent_executions: config.plugins.max_concurrent_executions,
            default_execution_timeout: Duration::from_secs(
                config.sandbox.default_execution_timeout_secs,
            ),
            wasm_max_memory_bytes: config.sandbox.wasm_max_memory_bytes,
        }
    }

    /// Use a different working-directory root.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Set the discovery directory.
    #[must_use]
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = Some(dir.into());
        self
    }

    /// Set the hook budget.
    #[must_use]
    pub fn with_initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = timeout;
        self
    }

    /// Set the unload drain budget.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set per-plugin concurrency.
    #[must_use]
    pub fn with_max_concurrent_executions(mut self, permits: u32) -> Self {
        self.max_concurrent_executions = permits;
        self
    }

    /// Set the fallback execution budget.
    #[must_use]
    pub fn with_default_execution_timeout(mut self, timeout: Duration) -> Self {
        self.default_execution_timeout = timeout;
        self
    }
}

/// Assembles a [`PluginManager`].
#[must_use]
pub struct PluginManagerBuilder {
    settings: ManagerSettings,
    policy: ValidationPolicy,
    sandbox: SandboxSettings,
    native: NativeModuleRegistry,
    evidence: Option<Arc<dyn EvidenceStore>>,
    config: Option<Arc<dyn ConfigSource>>,
}

impl PluginManagerBuilder {
    /// Lifecycle settings.
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Admission policy.
    pub fn validation_policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sandbox limits.
    pub fn sandbox_settings(mut self, settings: SandboxSettings) -> Self {
        self.sandbox = settings;
        self
    }

    /// Plugins linked into the host.
    pub fn native_modules(mut self, registry: NativeModuleRegistry) -> Self {
        self.native = registry;
        self
    }

    /// Host evidence store. Defaults to an in-memory store.
    pub fn evidence_store(mut self, store: Arc<dyn EvidenceStore>) -> Self {
        self.evidence = Some(store);
        self
    }

    /// Host configuration source. Defaults to an empty one.
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config = Some(source);
        self
    }

    /// Build the manager.
    #[must_use]
    pub fn build(self) -> PluginManager {
        let evidence = self
            .evidence
            .unwrap_or_else(|| Arc::new(MemoryEvidenceStore::new()));
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(StaticConfigSource::new()));
        let loader = ModuleLoader::new(Arc::new(self.native))
            .with_wasm_memory_limit(self.settings.wasm_max_memory_bytes);

        PluginManager {
            validator: PluginValidator::new(self.policy),
            sandbox: CapabilitySandbox::new(self.sandbox, evidence, config),
            loader,
            settings: self.settings,
            registry: RwLock::new(RegistryState::default()),
            lifecycle: Mutex::new(()),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<PluginId, RegistryEntry>,
    intents: BTreeMap<String, BTreeSet<PluginId>>,
    // Validating, Loading, Unloading or the last failure, per identity.
    transient: BTreeMap<PluginId, PluginState>,
}

impl RegistryState {
    fn insert(&mut self, entry: RegistryEntry) {
        let id = entry.shared.id.clone();
        for intent in &entry.shared.routed_intents {
            self.intents
                .entry(intent.clone())
                .or_default()
                .insert(id.clone());
        }
        self.transient.remove(&id);
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &PluginId) -> Option<RegistryEntry> {
        let entry = self.entries.remove(id)?;
        for intent in &entry.shared.routed_intents {
            if let Some(ids) = self.intents.get_mut(intent) {
                ids.remove(id);
                if ids.is_empty() {
                    self.intents.remove(intent);
                }
            }
        }
        Some(entry)
    }
}

/// Discovers, loads, tracks and unloads plugins.
pub struct PluginManager {
    settings: ManagerSettings,
    validator: PluginValidator,
    sandbox: CapabilitySandbox,
    loader: ModuleLoader,
    registry: RwLock<RegistryState>,
    lifecycle: Mutex<()>,
}

impl PluginManager {
    /// Start building a manager with default settings.
    pub fn builder() -> PluginManagerBuilder {
        PluginManagerBuilder {
            settings: ManagerSettings::default(),
            policy: ValidationPolicy::default(),
            sandbox: SandboxSettings::default(),
            native: NativeModuleRegistry::new(),
            evidence: None,
            config: None,
        }
    }

    /// Builder seeded from a full configuration. The configuration also
    /// serves as the plugins' `[settings]` source.
    pub fn from_config(config: &lantern_config::Config) -> PluginManagerBuilder {
        Self::builder()
            .settings(ManagerSettings::from_config(config))
            .validation_policy(ValidationPolicy::from_config(&config.plugins))
            .sandbox_settings(SandboxSettings::from_config(config))
            .config_source(Arc::new(config.clone()))
    }

    /// Lifecycle settings in force.
    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// The validator used on every load.
    #[must_use]
    pub fn validator(&self) -> &PluginValidator {
        &self.validator
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Scan `dir` for packages, reading manifests only.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `dir` cannot be listed.
    pub async fn discover(&self, dir: &Path) -> PluginResult<Vec<DiscoveredPlugin>> {
        let mut found = discovery::discover(dir, self.validator.policy().max_package_bytes).await?;
        let registry = self.registry.read().await;
        for plugin in &mut found {
            plugin.loaded = registry.entries.contains_key(&plugin.id);
        }
        Ok(found)
    }

    /// Discover then load every package in `dir`, one report per package.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `dir` cannot be listed. Per-package
    /// failures are in the reports.
    pub async fn load_directory(&self, dir: &Path) -> PluginResult<Vec<OperationReport>> {
        let found = self.discover(dir).await?;
        let mut reports = Vec::with_capacity(found.len());
        for plugin in found {
            reports.push(self.try_load(&plugin.path).await);
        }
        Ok(reports)
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Validate, unpack, sandbox, load, instantiate, initialize, self-check
    /// and register one package.
    ///
    /// Any failure releases everything acquired so far and leaves nothing
    /// registered.
    ///
    /// # Errors
    ///
    /// - [`PluginError::MalformedManifest`] / [`PluginError::PolicyRejected`]
    ///   when validation fails
    /// - [`PluginError::AlreadyLoaded`] for a duplicate identity, with no
    ///   side effects
    /// - [`PluginError::NoPluginImplementationFound`] from the loader
    /// - [`PluginError::InitializationFailed`] / [`PluginError::Timeout`]
    ///   from the plugin's hooks
    pub async fn load(&self, package: &Path) -> PluginResult<PluginId> {
        let _lifecycle = self.lifecycle.lock().await;

        let archive = self
            .validator
            .open(package)
            .await
            .map_err(|result| {
                result.to_error().unwrap_or_else(|| PluginError::PolicyRejected {
                    errors: vec!["package could not be read".into()],
                })
            })?;

        let pending = archive.manifest().ok().map(|m| m.id);
        if let Some(id) = &pending {
            if self.registry.read().await.entries.contains_key(id) {
                return Err(PluginError::AlreadyLoaded(id.clone()));
            }
            self.set_transient(id, PluginState::Validating).await;
        }

        let validation = self.validator.validate_archive(archive);
        for warning in &validation.warnings {
            warn!(package = %package.display(), warning = %warning, "Package validation warning");
        }
        let admitted = (
            validation.to_error(),
            validation.manifest.clone(),
            validation.archive().cloned(),
        );
        let (manifest, archive) = match admitted {
            (None, Some(manifest), Some(archive)) => (manifest, archive),
            (error, _, _) => {
                let error = error.unwrap_or_else(|| {
                    PluginError::MalformedManifest("package has no readable manifest".into())
                });
                if let Some(id) = &pending {
                    self.set_transient(id, PluginState::Failed(error.to_string())).await;
                }
                warn!(package = %package.display(), error = %error, "Package rejected");
                return Err(error);
            },
        };

        let id = manifest.id.clone();
        self.set_transient(&id, PluginState::Loading).await;

        match self.admit(manifest, archive).await {
            Ok(entry) => {
                let intents = entry.shared.routed_intents.clone();
                let working_dir = entry.working_dir.clone();
                self.registry.write().await.insert(entry);
                info!(
                    plugin_id = %id,
                    intents = ?intents,
                    working_dir = %working_dir.display(),
                    "Loaded plugin"
                );
                Ok(id)
            },
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Plugin load failed");
                self.set_transient(&id, PluginState::Failed(e.to_string())).await;
                Err(e)
            },
        }
    }

    /// [`load`](Self::load) reported as a boolean plus reason.
    pub async fn try_load(&self, package: &Path) -> OperationReport {
        match self.load(package).await {
            Ok(id) => OperationReport::ok(id),
            Err(e) => {
                let id = match &e {
                    PluginError::AlreadyLoaded(id)
                    | PluginError::InitializationFailed { plugin_id: id, .. } => Some(id.clone()),
                    _ => None,
                };
                OperationReport::failed(id, &e)
            },
        }
    }

    /// Steps after validation. On failure everything is torn down before
    /// returning.
    async fn admit(
        &self,
        manifest: PluginManifest,
        archive: Arc<PackageArchive>,
    ) -> PluginResult<RegistryEntry> {
        let id = manifest.id.clone();
        let working_dir = self
            .settings
            .work_dir
            .join(format!("{id}-{}", Uuid::new_v4()));

        let mut staged = Staged::default();
        match self
            .admit_staged(manifest, archive, &working_dir, &mut staged)
            .await
        {
            Ok(entry) => Ok(entry),
            Err(e) => {
                self.abandon(&id, staged, &working_dir).await;
                Err(e)
            },
        }
    }

    async fn admit_staged(
        &self,
        manifest: PluginManifest,
        archive: Arc<PackageArchive>,
        working_dir: &Path,
        staged: &mut Staged,
    ) -> PluginResult<RegistryEntry> {
        let id = manifest.id.clone();

        tokio::fs::create_dir_all(working_dir).await?;
        staged.working_dir_created = true;
        archive.extract_to_async(working_dir.to_path_buf()).await?;

        let context = Arc::new(self.sandbox.build_context(&manifest, working_dir).await?);
        staged.context = Some(Arc::clone(&context));

        let module = self
            .loader
            .load(working_dir, manifest.entry_point.as_ref())
            .await?;
        let module_kind = module.kind();
        let plugin = module.instantiate().await;
        staged.module = Some(module);
        let plugin = plugin?;

        let capabilities = plugin.capabilities();
        let routed_intents = negotiate(&manifest, &capabilities, &context)?;

        let plugin = self.initialize(&id, plugin, Arc::clone(&context)).await?;
        if let Err(e) = self.self_check(&id, &plugin).await {
            self.dispose_hook(&id, plugin).await;
            return Err(e);
        }

        let default_timeout = capabilities
            .default_timeout()
            .unwrap_or(self.settings.default_execution_timeout);
        let shared = Arc::new(LoadedPlugin::new(
            Arc::new(manifest),
            plugin,
            capabilities,
            routed_intents,
            context,
            module_kind,
            default_timeout,
            self.settings.max_concurrent_executions,
        ));

        let module = staged.module.take().ok_or_else(|| {
            PluginError::ExecutionFailure("module handle missing after load".into())
        })?;
        staged.context = None;
        staged.working_dir_created = false;

        Ok(RegistryEntry {
            shared,
            module,
            working_dir: working_dir.to_path_buf(),
        })
    }

    /// Run `initialize` in its own task under the hook budget.
    async fn initialize(
        &self,
        id: &PluginId,
        mut plugin: Box<dyn Plugin>,
        context: Arc<ExecutionContext>,
    ) -> PluginResult<Arc<dyn Plugin>> {
        let task = tokio::spawn(async move {
            let result = plugin.initialize(context).await;
            (plugin, result)
        });
        match await_hook(task, self.settings.initialize_timeout).await {
            Some(Ok((plugin, Ok(())))) => Ok(Arc::from(plugin)),
            Some(Ok((plugin, Err(e)))) => {
                self.dispose_hook(id, Arc::from(plugin)).await;
                Err(PluginError::InitializationFailed {
                    plugin_id: id.clone(),
                    message: e.to_string(),
                })
            },
            Some(Err(join)) => Err(PluginError::InitializationFailed {
                plugin_id: id.clone(),
                message: format!("initialize panicked: {join}"),
            }),
            None => Err(PluginError::Timeout {
                operation: format!("{id} initialize"),
                after: self.settings.initialize_timeout,
            }),
        }
    }

    /// Run the plugin's self-check under the hook budget.
    async fn self_check(&self, id: &PluginId, plugin: &Arc<dyn Plugin>) -> PluginResult<()> {
        let plugin = Arc::clone(plugin);
        let task = tokio::spawn(async move { plugin.validate().await });
        match await_hook(task, self.settings.initialize_timeout).await {
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(PluginError::InitializationFailed {
                plugin_id: id.clone(),
                message: format!("self-check failed: {e}"),
            }),
            Some(Err(join)) => Err(PluginError::InitializationFailed {
                plugin_id: id.clone(),
                message: format!("self-check panicked: {join}"),
            }),
            None => Err(PluginError::Timeout {
                operation: format!("{id} validate"),
                after: self.settings.initialize_timeout,
            }),
        }
    }

    /// Best-effort dispose hook; failures are logged.
    async fn dispose_hook(&self, id: &PluginId, plugin: Arc<dyn Plugin>) {
        let task = tokio::spawn(async move { plugin.dispose().await });
        match await_hook(task, self.settings.initialize_timeout).await {
            Some(Ok(Ok(()))) => debug!(plugin_id = %id, "Dispose hook completed"),
            Some(Ok(Err(e))) => warn!(plugin_id = %id, error = %e, "Dispose hook failed"),
            Some(Err(join)) => warn!(plugin_id = %id, error = %join, "Dispose hook panicked"),
            None => warn!(plugin_id = %id, "Dispose hook timed out"),
        }
    }

    /// Release whatever a failed load acquired.
    async fn abandon(&self, id: &PluginId, staged: Staged, working_dir: &Path) {
        if let Some(context) = staged.context {
            context.dispose().await;
        }
        if let Some(module) = staged.module {
            self.release_module(id, module);
        }
        if staged.working_dir_created {
            remove_working_dir(id, working_dir).await;
        }
    }

    fn release_module(&self, id: &PluginId, module: ModuleHandle) -> ReleaseOutcome {
        debug!(plugin_id = %id, module = %module.path().display(), "Releasing plugin module");
        self.loader.release(module)
    }

    // -----------------------------------------------------------------------
    // Unload
    // -----------------------------------------------------------------------

    /// Detach, drain, dispose, release and delete one plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotLoaded`] if `id` is not loaded.
    pub async fn unload(&self, id: &PluginId) -> PluginResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.unload_locked(id).await.map(|_| ())
    }

    /// [`unload`](Self::unload) reported as a boolean plus reason.
    pub async fn try_unload(&self, id: &PluginId) -> OperationReport {
        match self.unload(id).await {
            Ok(()) => OperationReport::ok(id.clone()),
            Err(e) => OperationReport::failed(Some(id.clone()), &e),
        }
    }

    /// Unload every plugin. Used on shutdown.
    pub async fn unload_all(&self) -> Vec<OperationReport> {
        let _lifecycle = self.lifecycle.lock().await;
        let ids: Vec<PluginId> = self.registry.read().await.entries.keys().cloned().collect();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            reports.push(match self.unload_locked(&id).await {
                Ok(_) => OperationReport::ok(id),
                Err(e) => OperationReport::failed(Some(id), &e),
            });
        }
        reports
    }

    async fn unload_locked(&self, id: &PluginId) -> PluginResult<ReleaseOutcome> {
        let entry = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .remove(id)
                .ok_or_else(|| PluginError::NotLoaded(id.clone()))?;
            registry.transient.insert(id.clone(), PluginState::Unloading);
            entry
        };
        let RegistryEntry {
            shared,
            module,
            working_dir,
        } = entry;

        let drained = shared.close_and_drain(self.settings.drain_timeout).await;
        if let Some(plugin) = shared.take_plugin().await {
            self.dispose_hook(id, plugin).await;
        }
        shared.context.dispose().await;
        let outcome = self.release_module(id, module);
        remove_working_dir(id, &working_dir).await;

        self.registry.write().await.transient.remove(id);
        info!(
            plugin_id = %id,
            drained,
            reclaimed = matches!(outcome, ReleaseOutcome::Reclaimed),
            "Unloaded plugin"
        );
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Handle for a loaded plugin.
    pub async fn get_plugin(&self, id: &PluginId) -> Option<PluginHandle> {
        self.registry
            .read()
            .await
            .entries
            .get(id)
            .map(|e| PluginHandle::new(Arc::clone(&e.shared)))
    }

    /// Every loaded plugin routed for `intent`, in no guaranteed order.
    pub async fn get_by_intent(&self, intent: &str) -> Vec<PluginHandle> {
        let registry = self.registry.read().await;
        registry
            .intents
            .get(intent)
            .into_iter()
            .flatten()
            .filter_map(|id| registry.entries.get(id))
            .map(|e| PluginHandle::new(Arc::clone(&e.shared)))
            .collect()
    }

    /// Summaries of every loaded plugin, sorted by id.
    pub async fn list(&self) -> Vec<PluginInfo> {
        self.registry
            .read()
            .await
            .entries
            .values()
            .map(|e| PluginInfo::from(e.shared.as_ref()))
            .collect()
    }

    /// Number of loaded plugins.
    pub async fn len(&self) -> usize {
        self.registry.read().await.entries.len()
    }

    /// Whether no plugin is loaded.
    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.entries.is_empty()
    }

    /// Lifecycle state of `id`.
    pub async fn state(&self, id: &PluginId) -> PluginState {
        let registry = self.registry.read().await;
        if registry.entries.contains_key(id) {
            return PluginState::Loaded;
        }
        registry
            .transient
            .get(id)
            .cloned()
            .unwrap_or(PluginState::Unloaded)
    }

    /// Working directory of a loaded plugin.
    pub async fn working_dir(&self, id: &PluginId) -> Option<PathBuf> {
        self.registry
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.working_dir.clone())
    }

    async fn set_transient(&self, id: &PluginId, state: PluginState) {
        self.registry
            .write()
            .await
            .transient
            .insert(id.clone(), state);
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("settings", &self.settings)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

/// Resources a load has acquired so far.
#[derive(Default)]
struct Staged {
    working_dir_created: bool,
    context: Option<Arc<ExecutionContext>>,
    module: Option<ModuleHandle>,
}

/// Intersect what the plugin declares with what the manifest and sandbox
/// grant. Returns the routed intents.
fn negotiate(
    manifest: &PluginManifest,
    capabilities: &Capabilities,
    context: &ExecutionContext,
) -> PluginResult<BTreeSet<String>> {
    let declared = manifest.intents();
    let routed: BTreeSet<String> = if capabilities.supported_intents.is_empty() {
        declared.clone()
    } else {
        declared
            .intersection(&capabilities.supported_intents)
            .cloned()
            .collect()
    };

    let ignored: Vec<&String> = capabilities
        .supported_intents
        .difference(declared)
        .collect();
    if !ignored.is_empty() {
        debug!(
            plugin_id = %manifest.id,
            ignored = ?ignored,
            "Plugin supports intents its manifest does not declare"
        );
    }

    let mut errors = Vec::new();
    if routed.is_empty() {
        errors.push("plugin supports none of the intents its manifest declares".to_string());
    }
    if capabilities.requires_network && !context.has_permission(NETWORK_API) {
        errors.push(format!(
            "plugin requires network access but '{NETWORK_API}' was not approved"
        ));
    }
    if capabilities.requires_elevated_privilege {
        errors.push("plugin requires elevated privilege, which is never granted".to_string());
    }
    if capabilities.requires_accelerator && !manifest.capabilities.requires_gpu {
        warn!(
            plugin_id = %manifest.id,
            "Plugin wants an accelerator its manifest does not declare; continuing without one"
        );
    }

    if errors.is_empty() {
        Ok(routed)
    } else {
        Err(PluginError::PolicyRejected { errors })
    }
}

/// Await a lifecycle hook for at most `budget`. `None` means it timed out;
/// the task is then aborted and reaped so nothing it holds outlives the call.
async fn await_hook<T>(
    mut task: JoinHandle<T>,
    budget: Duration,
) -> Option<Result<T, JoinError>> {
    if let Ok(joined) = tokio::time::timeout(budget, &mut task).await {
        return Some(joined);
    }
    task.abort();
    match tokio::time::timeout(budget, task).await {
        Ok(Err(join)) if join.is_panic() => {
            warn!(error = %join, "Hook panicked while being aborted");
        },
        Ok(_) => {},
        Err(_) => warn!("Aborted hook did not yield; its task is detached"),
    }
    None
}

async fn remove_working_dir(id: &PluginId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(plugin_id = %id, dir = %dir.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(
            plugin_id = %id,
            dir = %dir.display(),
            error = %e,
            "Failed to remove working directory"
        ),
    }
}

#[cfg(test)]
mod tests;
