//! Isolated module loader.
//!
//! Finds the single plugin-contract implementation in an unpacked package
//! and wraps it in a [`ModuleHandle`]. The handle owns the module arena;
//! every instance created from it holds a clone. [`ModuleLoader::release`]
//! consumes the handle and probes the arena through a `Weak` to report
//! whether it was actually reclaimed.
//!
//! Candidates are resolved by entry-point identifier, never by guessing:
//!
//! - a `*.wasm` module is a candidate when it exports the entry symbol
//!   (`lantern_execute` unless the manifest overrides it)
//! - a `*.native` descriptor is a candidate when its symbol is registered
//!   in the [`NativeModuleRegistry`]
//!
//! Zero or several candidates is [`PluginError::NoPluginImplementationFound`].

mod native;
mod wasm;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use native::{NativeDescriptor, NativeFactory, NativeModuleRegistry};
pub use wasm::DEFAULT_ENTRY_SYMBOL;

use self::wasm::{WasmModule, WasmPlugin};
use crate::error::{PluginError, PluginResult};
use crate::manifest::EntryPoint;
use crate::package::{MODULE_EXTENSIONS, MODULES_DIR};
use crate::plugin::{Capabilities, Plugin};
use crate::request::{PluginRequest, PluginResponse};
use crate::sandbox::ExecutionContext;

/// Default WASM linear-memory cap: 64 MiB.
const DEFAULT_WASM_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// How a module is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Extism-hosted WebAssembly.
    Wasm,
    /// Linked into the host, resolved through the native registry.
    Native,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wasm => f.write_str("wasm"),
            Self::Native => f.write_str("native"),
        }
    }
}

enum ModuleBody {
    Wasm(WasmModule),
    Native(NativeFactory),
}

/// Everything a loaded module owns. Dropped when the handle and every
/// instance are gone.
pub(crate) struct ModuleArena {
    path: PathBuf,
    symbol: String,
    body: ModuleBody,
}

/// A loaded module, ready to instantiate.
pub struct ModuleHandle {
    arena: Arc<ModuleArena>,
}

impl ModuleHandle {
    /// Module file the handle was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.arena.path
    }

    /// Entry symbol (WASM export or native registration symbol).
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.arena.symbol
    }

    /// Module kind.
    #[must_use]
    pub fn kind(&self) -> ModuleKind {
        match self.arena.body {
            ModuleBody::Wasm(_) => ModuleKind::Wasm,
            ModuleBody::Native(_) => ModuleKind::Native,
        }
    }

    /// Instances still holding the arena.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        Arc::strong_count(&self.arena).saturating_sub(1)
    }

    /// Construct a new, uninitialized plugin instance.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::WasmError`] if a WASM module fails to compile
    /// or describe itself.
    pub async fn instantiate(&self) -> PluginResult<Box<dyn Plugin>> {
        let arena = Arc::clone(&self.arena);
        match &self.arena.body {
            ModuleBody::Native(factory) => Ok(Box::new(NativeInstance {
                inner: factory(),
                _arena: arena,
            })),
            ModuleBody::Wasm(module) => {
                let plugin =
                    WasmPlugin::instantiate(arena, module, self.arena.symbol.clone()).await?;
                Ok(Box::new(plugin))
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn arena_probe(&self) -> Weak<ModuleArena> {
        Arc::downgrade(&self.arena)
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("path", &self.arena.path)
            .field("symbol", &self.arena.symbol)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Result of [`ModuleLoader::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The arena was dropped.
    Reclaimed,
    /// Something still holds the arena.
    Retained {
        /// Remaining strong references.
        outstanding: usize,
    },
}

/// Native plugin bound to its arena.
struct NativeInstance {
    inner: Box<dyn Plugin>,
    _arena: Arc<ModuleArena>,
}

#[async_trait]
impl Plugin for NativeInstance {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn initialize(&mut self, ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        self.inner.initialize(ctx).await
    }

    async fn validate(&self) -> PluginResult<()> {
        self.inner.validate().await
    }

    async fn execute(
        &self,
        request: PluginRequest,
        cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        self.inner.execute(request, cancel).await
    }

    async fn dispose(&self) -> PluginResult<()> {
        self.inner.dispose().await
    }
}

/// Loads plugin modules out of unpacked packages.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    native: Arc<NativeModuleRegistry>,
    wasm_max_memory_bytes: u64,
}

impl ModuleLoader {
    /// Loader resolving native modules against `native`.
    #[must_use]
    pub fn new(native: Arc<NativeModuleRegistry>) -> Self {
        Self {
            native,
            wasm_max_memory_bytes: DEFAULT_WASM_MAX_MEMORY_BYTES,
        }
    }

    /// Cap WASM linear memory.
    #[must_use]
    pub fn with_wasm_memory_limit(mut self, bytes: u64) -> Self {
        self.wasm_max_memory_bytes = bytes;
        self
    }

    /// Native symbols this loader can resolve.
    #[must_use]
    pub fn native_registry(&self) -> &NativeModuleRegistry {
        &self.native
    }

    /// Locate and load the single plugin implementation under `working_dir`.
    ///
    /// With an entry hint only the declared module is examined, its symbol
    /// overrides the default and its hash is verified. Without one, every
    /// module file directly in `working_dir` or `working_dir/modules` is
    /// scanned.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NoPluginImplementationFound`] for zero or multiple
    ///   candidates
    /// - [`PluginError::HashMismatch`] if the declared hash does not match
    /// - [`PluginError::Io`] if the directory cannot be read
    pub async fn load(
        &self,
        working_dir: &Path,
        entry_hint: Option<&EntryPoint>,
    ) -> PluginResult<ModuleHandle> {
        let paths = match entry_hint {
            Some(entry) => {
                let path = working_dir.join(&entry.module);
                if !tokio::fs::try_exists(&path).await? {
                    return Err(PluginError::NoPluginImplementationFound {
                        message: format!("declared entry module '{}' does not exist", entry.module),
                    });
                }
                vec![path]
            },
            None => scan_module_files(working_dir).await?,
        };

        let mut candidates = Vec::new();
        for path in paths {
            if let Some(arena) = self.probe(&path, entry_hint).await? {
                candidates.push(arena);
            }
        }

        match candidates.len() {
            0 => Err(PluginError::NoPluginImplementationFound {
                message: format!(
                    "no module in {} exports '{}' or names a registered native symbol",
                    working_dir.display(),
                    entry_hint
                        .and_then(|e| e.symbol.as_deref())
                        .unwrap_or(DEFAULT_ENTRY_SYMBOL)
                ),
            }),
            1 => {
                let arena = candidates.remove(0);
                let handle = ModuleHandle {
                    arena: Arc::new(arena),
                };
                info!(
                    module = %handle.path().display(),
                    symbol = handle.symbol(),
                    kind = %handle.kind(),
                    "Loaded plugin module"
                );
                Ok(handle)
            },
            n => {
                let found: Vec<String> = candidates
                    .iter()
                    .map(|a| a.path.display().to_string())
                    .collect();
                Err(PluginError::NoPluginImplementationFound {
                    message: format!(
                        "ambiguous: {n} modules implement the plugin contract ({})",
                        found.join(", ")
                    ),
                })
            },
        }
    }

    /// Drop the handle and report whether the arena was reclaimed.
    ///
    /// A retained arena means an instance is still alive somewhere; it is
    /// logged as a warning.
    pub fn release(&self, handle: ModuleHandle) -> ReleaseOutcome {
        let path = handle.arena.path.clone();
        let probe = Arc::downgrade(&handle.arena);
        drop(handle);

        match probe.strong_count() {
            0 => {
                debug!(module = %path.display(), "Module arena reclaimed");
                ReleaseOutcome::Reclaimed
            },
            outstanding => {
                warn!(
                    module = %path.display(),
                    outstanding,
                    "Module arena still referenced after release"
                );
                ReleaseOutcome::Retained { outstanding }
            },
        }
    }

    /// Examine one module file. `Ok(None)` means "not a candidate".
    async fn probe(
        &self,
        path: &Path,
        entry_hint: Option<&EntryPoint>,
    ) -> PluginResult<Option<ModuleArena>> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let bytes = tokio::fs::read(path).await?;

        if let Some(expected) = entry_hint.and_then(|e| e.hash.as_deref()) {
            let actual = blake3::hash(&bytes).to_hex().to_string();
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(PluginError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        let symbol_override = entry_hint.and_then(|e| e.symbol.clone());

        match extension {
            "wasm" => {
                let exports = match wasm::exported_functions(&bytes) {
                    Ok(exports) => exports,
                    Err(e) if entry_hint.is_some() => return Err(e),
                    Err(e) => {
                        warn!(module = %path.display(), error = %e, "Skipping unreadable WASM module");
                        return Ok(None);
                    },
                };
                let symbol = symbol_override.unwrap_or_else(|| DEFAULT_ENTRY_SYMBOL.to_string());
                if !exports.contains(&symbol) {
                    debug!(module = %path.display(), symbol = %symbol, "WASM module lacks entry export");
                    return Ok(None);
                }
                Ok(Some(ModuleArena {
                    path: path.to_path_buf(),
                    symbol,
                    body: ModuleBody::Wasm(WasmModule {
                        bytes: Arc::from(bytes),
                        exports,
                        max_memory_bytes: self.wasm_max_memory_bytes,
                    }),
                }))
            },
            "native" => {
                let symbol = match symbol_override {
                    Some(symbol) => symbol,
                    None => match NativeDescriptor::parse(&bytes) {
                        Ok(descriptor) => descriptor.symbol,
                        Err(e) if entry_hint.is_some() => return Err(e),
                        Err(e) => {
                            warn!(module = %path.display(), error = %e, "Skipping native descriptor");
                            return Ok(None);
                        },
                    },
                };
                let Some(factory) = self.native.resolve(&symbol) else {
                    debug!(module = %path.display(), symbol = %symbol, "Native symbol not registered");
                    return Ok(None);
                };
                Ok(Some(ModuleArena {
                    path: path.to_path_buf(),
                    symbol,
                    body: ModuleBody::Native(factory),
                }))
            },
            other => Err(PluginError::NoPluginImplementationFound {
                message: format!(
                    "unsupported module type '.{other}' (expected one of: {})",
                    MODULE_EXTENSIONS.join(", ")
                ),
            }),
        }
    }
}

/// Regular module files directly in `dir` and `dir/modules`, sorted.
async fn scan_module_files(dir: &Path) -> PluginResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    for scan_dir in [dir.to_path_buf(), dir.join(MODULES_DIR)] {
        let mut entries = match tokio::fs::read_dir(&scan_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let is_module = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| MODULE_EXTENSIONS.contains(&ext));
            if is_module {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    struct Nop;

    #[async_trait]
    impl Plugin for Nop {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().with_intent("noop")
        }

        async fn initialize(&mut self, _ctx: Arc<ExecutionContext>) -> PluginResult<()> {
            Ok(())
        }

        async fn execute(
            &self,
            _request: PluginRequest,
            _cancel: CancellationToken,
        ) -> PluginResult<PluginResponse> {
            Ok(PluginResponse::success(serde_json::Value::Null))
        }
    }

    fn loader() -> ModuleLoader {
        ModuleLoader::new(Arc::new(
            NativeModuleRegistry::new().with("test.nop", || Box::new(Nop)),
        ))
    }

    fn write(dir: &Path, relative: &str, bytes: &[u8]) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn single_native_candidate_loads() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "plugin.native", br#"{"symbol":"test.nop"}"#);
        write(dir.path(), "README.md", b"not a module");

        let handle = loader().load(dir.path(), None).await.unwrap();
        assert_eq!(handle.kind(), ModuleKind::Native);
        assert_eq!(handle.symbol(), "test.nop");

        let plugin = handle.instantiate().await.unwrap();
        assert!(plugin.capabilities().supported_intents.contains("noop"));
    }

    #[tokio::test]
    async fn wasm_candidate_found_in_modules_dir() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "modules/tool.wasm",
            &wasm::module_exporting(&[DEFAULT_ENTRY_SYMBOL]),
        );
        write(
            dir.path(),
            "modules/helper.wasm",
            &wasm::module_exporting(&["something_else"]),
        );

        let handle = loader().load(dir.path(), None).await.unwrap();
        assert_eq!(handle.kind(), ModuleKind::Wasm);
        assert!(handle.path().ends_with("modules/tool.wasm"));
    }

    #[tokio::test]
    async fn zero_candidates_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.native", br#"{"symbol":"test.unregistered"}"#);
        write(dir.path(), "b.wasm", &wasm::module_exporting(&["other"]));
        write(dir.path(), "nested/deep/c.wasm", &wasm::module_exporting(&[DEFAULT_ENTRY_SYMBOL]));

        let err = loader().load(dir.path(), None).await.unwrap_err();
        assert!(matches!(err, PluginError::NoPluginImplementationFound { .. }));
    }

    #[tokio::test]
    async fn ambiguous_candidates_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.native", br#"{"symbol":"test.nop"}"#);
        write(dir.path(), "b.wasm", &wasm::module_exporting(&[DEFAULT_ENTRY_SYMBOL]));

        let err = loader().load(dir.path(), None).await.unwrap_err();
        match err {
            PluginError::NoPluginImplementationFound { message } => {
                assert!(message.contains("ambiguous"), "{message}");
            },
            other => panic!("expected NoPluginImplementationFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn entry_hint_selects_one_module() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.native", br#"{"symbol":"test.nop"}"#);
        let custom = wasm::module_exporting(&["run"]);
        write(dir.path(), "b.wasm", &custom);

        let hint = EntryPoint {
            module: "b.wasm".into(),
            symbol: Some("run".into()),
            hash: Some(blake3::hash(&custom).to_hex().to_string()),
        };
        let handle = loader().load(dir.path(), Some(&hint)).await.unwrap();
        assert_eq!(handle.kind(), ModuleKind::Wasm);
        assert_eq!(handle.symbol(), "run");
    }

    #[tokio::test]
    async fn entry_hint_symbol_overrides_native_descriptor() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "plugin.native", br#"{"symbol":"test.unregistered"}"#);
        let hint = EntryPoint {
            module: "plugin.native".into(),
            symbol: Some("test.nop".into()),
            hash: None,
        };
        let handle = loader().load(dir.path(), Some(&hint)).await.unwrap();
        assert_eq!(handle.symbol(), "test.nop");
    }

    #[tokio::test]
    async fn entry_hint_hash_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "plugin.native", br#"{"symbol":"test.nop"}"#);
        let hint = EntryPoint {
            module: "plugin.native".into(),
            symbol: None,
            hash: Some("0".repeat(64)),
        };
        assert!(matches!(
            loader().load(dir.path(), Some(&hint)).await,
            Err(PluginError::HashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn missing_entry_module_rejected() {
        let dir = TempDir::new().unwrap();
        let hint = EntryPoint {
            module: "modules/missing.wasm".into(),
            symbol: None,
            hash: None,
        };
        assert!(matches!(
            loader().load(dir.path(), Some(&hint)).await,
            Err(PluginError::NoPluginImplementationFound { .. })
        ));
    }

    #[tokio::test]
    async fn release_reports_outstanding_instances() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "plugin.native", br#"{"symbol":"test.nop"}"#);
        let loader = loader();

        let handle = loader.load(dir.path(), None).await.unwrap();
        let instance = handle.instantiate().await.unwrap();
        assert_eq!(handle.live_instances(), 1);
        assert_eq!(
            loader.release(handle),
            ReleaseOutcome::Retained { outstanding: 1 }
        );
        drop(instance);

        let handle = loader.load(dir.path(), None).await.unwrap();
        let probe = handle.arena_probe();
        let instance = handle.instantiate().await.unwrap();
        drop(instance);
        assert_eq!(loader.release(handle), ReleaseOutcome::Reclaimed);
        assert!(probe.upgrade().is_none());
    }
}
