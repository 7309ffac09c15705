//! WASM plugins backed by Extism.
//!
//! Each instance is its own Extism store with its own linear memory; the
//! module's dependencies are linked into it, so nothing is shared with the
//! host or with other plugins. Guest ABI:
//!
//! | Export | Input | Output |
//! |---|---|---|
//! | entry (`lantern_execute`) | request JSON | response JSON |
//! | `lantern_describe` (optional) | empty | capabilities JSON |
//! | `lantern_initialize` / `lantern_validate` / `lantern_dispose` (optional) | empty | ignored |
//!
//! A guest error or trap fails the call.

pub(crate) mod host;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use extism::{CancelHandle, Manifest, PluginBuilder, UserData, Wasm};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::host::{HostState, register_host_functions};
use super::ModuleArena;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{Capabilities, Plugin};
use crate::request::{PluginRequest, PluginResponse};
use crate::sandbox::ExecutionContext;

/// Default contract entry export.
pub const DEFAULT_ENTRY_SYMBOL: &str = "lantern_execute";

const DESCRIBE_EXPORT: &str = "lantern_describe";
const INITIALIZE_EXPORT: &str = "lantern_initialize";
const VALIDATE_EXPORT: &str = "lantern_validate";
const DISPOSE_EXPORT: &str = "lantern_dispose";

const WASM_PAGE_BYTES: u64 = 64 * 1024;

/// Compiled-module bytes and what the export scan found.
#[derive(Debug)]
pub(crate) struct WasmModule {
    pub(crate) bytes: Arc<[u8]>,
    pub(crate) exports: BTreeSet<String>,
    pub(crate) max_memory_bytes: u64,
}

/// Names of the function exports of `bytes`.
pub(crate) fn exported_functions(bytes: &[u8]) -> PluginResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for payload in wasmparser::Parser::new(0).parse_all(bytes) {
        let payload =
            payload.map_err(|e| PluginError::WasmError(format!("invalid WASM module: {e}")))?;
        if let wasmparser::Payload::ExportSection(reader) = payload {
            for export in reader {
                let export = export
                    .map_err(|e| PluginError::WasmError(format!("failed to read export: {e}")))?;
                if export.kind == wasmparser::ExternalKind::Func {
                    names.insert(export.name.to_string());
                }
            }
        }
    }
    Ok(names)
}

fn build_instance(
    bytes: &[u8],
    max_memory_bytes: u64,
    user_data: &UserData<HostState>,
) -> PluginResult<extism::Plugin> {
    let pages = u32::try_from(max_memory_bytes / WASM_PAGE_BYTES).unwrap_or(u32::MAX);
    let manifest = Manifest::new([Wasm::data(bytes.to_vec())]).with_memory_max(pages);
    let builder = PluginBuilder::new(manifest).with_wasi(false);
    register_host_functions(builder, user_data)
        .build()
        .map_err(|e| PluginError::WasmError(format!("failed to build Extism plugin: {e}")))
}

/// A plugin instance running inside its own WASM store.
pub(crate) struct WasmPlugin {
    // Keeps the module arena alive for as long as the instance exists.
    _arena: Arc<ModuleArena>,
    entry: String,
    exports: BTreeSet<String>,
    instance: Arc<Mutex<extism::Plugin>>,
    interrupt: CancelHandle,
    state: UserData<HostState>,
    capabilities: Capabilities,
}

impl WasmPlugin {
    /// Compile and instantiate `module`, then read its self-description.
    ///
    /// The memory cap is the smaller of the host limit and the ceiling the
    /// guest declares; a lower guest ceiling means one rebuild.
    pub(crate) async fn instantiate(
        arena: Arc<ModuleArena>,
        module: &WasmModule,
        entry: String,
    ) -> PluginResult<Self> {
        let user_data = UserData::new(HostState::new(tokio::runtime::Handle::current()));
        let bytes = Arc::clone(&module.bytes);
        let host_limit = module.max_memory_bytes;
        let describe = module.exports.contains(DESCRIBE_EXPORT);
        let ud = user_data.clone();

        let (instance, capabilities) = tokio::task::spawn_blocking(move || {
            let mut instance = build_instance(&bytes, host_limit, &ud)?;
            let capabilities = if describe {
                let json = instance
                    .call::<&str, String>(DESCRIBE_EXPORT, "")
                    .map_err(|e| PluginError::WasmError(format!("{DESCRIBE_EXPORT} failed: {e}")))?;
                serde_json::from_str::<Capabilities>(&json).map_err(|e| {
                    PluginError::WasmError(format!("invalid {DESCRIBE_EXPORT} output: {e}"))
                })?
            } else {
                Capabilities::new()
            };
            if let Some(ceiling) = capabilities.max_memory_bytes
                && ceiling < host_limit
            {
                instance = build_instance(&bytes, ceiling, &ud)?;
            }
            Ok::<_, PluginError>((instance, capabilities))
        })
        .await
        .map_err(|e| PluginError::WasmError(format!("instantiation task failed: {e}")))??;

        debug!(
            entry = %entry,
            exports = module.exports.len(),
            "Instantiated WASM module"
        );

        Ok(Self {
            interrupt: instance.cancel_handle(),
            instance: Arc::new(Mutex::new(instance)),
            _arena: arena,
            entry,
            exports: module.exports.clone(),
            state: user_data,
            capabilities,
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> PluginResult<R> {
        let ud = self
            .state
            .get()
            .map_err(|e| PluginError::WasmError(format!("host state unavailable: {e}")))?;
        let mut state = ud
            .lock()
            .map_err(|e| PluginError::WasmError(format!("host state lock poisoned: {e}")))?;
        Ok(f(&mut state))
    }

    /// Run one guest export on the blocking pool. Calls on one instance
    /// are serialized; `cancel` interrupts the guest.
    async fn call(
        &self,
        export: &str,
        input: String,
        cancel: &CancellationToken,
    ) -> PluginResult<String> {
        let instance = Arc::clone(&self.instance);
        let name = export.to_string();
        let call_token = cancel.clone();
        let state = self.state.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            let mut guard = instance
                .lock()
                .map_err(|_| PluginError::WasmError("instance lock poisoned".into()))?;
            if let Ok(ud) = state.get()
                && let Ok(mut host) = ud.lock()
            {
                host.cancel = call_token;
            }
            guard
                .call::<&str, String>(&name, input.as_str())
                .map_err(|e| PluginError::ExecutionFailure(format!("{name} failed: {e}")))
        });

        tokio::select! {
            joined = &mut task => joined
                .map_err(|e| PluginError::WasmError(format!("guest call task failed: {e}")))?,
            () = cancel.cancelled() => {
                let _ = self.interrupt.cancel();
                let _ = task.await;
                Err(PluginError::Cancelled(format!("{export} interrupted")))
            },
        }
    }

    async fn call_hook(&self, export: &str) -> PluginResult<()> {
        if !self.exports.contains(export) {
            return Ok(());
        }
        self.call(export, String::new(), &CancellationToken::new())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn initialize(&mut self, ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        self.with_state(|state| state.context = Some(ctx))?;
        self.call_hook(INITIALIZE_EXPORT).await
    }

    async fn validate(&self) -> PluginResult<()> {
        self.call_hook(VALIDATE_EXPORT).await
    }

    async fn execute(
        &self,
        request: PluginRequest,
        cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        let input = serde_json::to_string(&request)
            .map_err(|e| PluginError::ExecutionFailure(format!("failed to encode request: {e}")))?;
        let output = self.call(&self.entry, input, &cancel).await?;
        serde_json::from_str(&output).map_err(|e| {
            PluginError::ExecutionFailure(format!("{} returned an invalid response: {e}", self.entry))
        })
    }

    async fn dispose(&self) -> PluginResult<()> {
        let result = self.call_hook(DISPOSE_EXPORT).await;
        self.with_state(|state| state.context = None)?;
        result
    }
}

/// A minimal module whose single function is exported under each of `names`.
#[cfg(test)]
pub(crate) fn module_exporting(names: &[&str]) -> Vec<u8> {
    let mut module = wasm_encoder::Module::new();

    let mut types = wasm_encoder::TypeSection::new();
    types.ty().function([], [wasm_encoder::ValType::I32]);
    module.section(&types);

    let mut funcs = wasm_encoder::FunctionSection::new();
    funcs.function(0);
    module.section(&funcs);

    let mut exports = wasm_encoder::ExportSection::new();
    for name in names {
        exports.export(name, wasm_encoder::ExportKind::Func, 0);
    }
    module.section(&exports);

    let mut code = wasm_encoder::CodeSection::new();
    let mut body = wasm_encoder::Function::new([]);
    body.instruction(&wasm_encoder::Instruction::I32Const(0));
    body.instruction(&wasm_encoder::Instruction::End);
    code.function(&body);
    module.section(&code);

    module.finish()
}
