//! Host functions imported by WASM plugins.
//!
//! Every function routes through the plugin's [`ExecutionContext`], so a
//! guest gets exactly the brokered access a native plugin would. Arguments
//! and results are guest memory handles; structured values travel as JSON.
//! A refused or failed call traps the guest, which surfaces as a failed
//! execution.

use std::sync::Arc;

use extism::{CurrentPlugin, Error, PluginBuilder, UserData, Val, ValType};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::sandbox::{ExecutionContext, HttpRequest, LogLevel};

/// Longest log line accepted from a guest.
const MAX_LOG_MESSAGE_LEN: u64 = 64 * 1024;
/// Longest key (config or evidence) accepted from a guest.
const MAX_KEY_LEN: u64 = 1024;
/// Largest JSON argument accepted from a guest.
const MAX_JSON_ARG_LEN: u64 = 1024 * 1024;
/// Largest payload a guest may hand the host to write or store.
const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

/// State shared between a WASM instance and its host functions.
pub(crate) struct HostState {
    /// Bound by `initialize`, cleared by `dispose`.
    pub(crate) context: Option<Arc<ExecutionContext>>,
    /// Cancellation for the guest call in progress.
    pub(crate) cancel: CancellationToken,
    pub(crate) runtime: Handle,
}

impl HostState {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            context: None,
            cancel: CancellationToken::new(),
            runtime,
        }
    }
}

/// The functions a guest may import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostFunction {
    Log,
    GetConfig,
    ReadFile,
    WriteFile,
    HttpRequest,
    RunTool,
    StoreEvidence,
}

impl HostFunction {
    pub(crate) const ALL: [Self; 7] = [
        Self::Log,
        Self::GetConfig,
        Self::ReadFile,
        Self::WriteFile,
        Self::HttpRequest,
        Self::RunTool,
        Self::StoreEvidence,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Log => "lantern_log",
            Self::GetConfig => "lantern_get_config",
            Self::ReadFile => "lantern_read_file",
            Self::WriteFile => "lantern_write_file",
            Self::HttpRequest => "lantern_http_request",
            Self::RunTool => "lantern_run_tool",
            Self::StoreEvidence => "lantern_store_evidence",
        }
    }

    fn arg_count(self) -> usize {
        match self {
            Self::GetConfig | Self::ReadFile | Self::HttpRequest | Self::RunTool => 1,
            Self::Log | Self::WriteFile | Self::StoreEvidence => 2,
        }
    }

    fn returns_value(self) -> bool {
        !matches!(self, Self::Log | Self::WriteFile)
    }
}

/// Attach every [`HostFunction`] to `builder`.
pub(crate) fn register_host_functions<'a>(
    mut builder: PluginBuilder<'a>,
    user_data: &UserData<HostState>,
) -> PluginBuilder<'a> {
    for func in HostFunction::ALL {
        let ud = user_data.clone();
        let args: Vec<ValType> = vec![extism::PTR; func.arg_count()];
        let rets: Vec<ValType> = if func.returns_value() {
            vec![extism::PTR]
        } else {
            Vec::new()
        };

        builder = match func {
            HostFunction::Log => builder.with_function(func.name(), args, rets, ud, log_impl),
            HostFunction::GetConfig => {
                builder.with_function(func.name(), args, rets, ud, get_config_impl)
            },
            HostFunction::ReadFile => {
                builder.with_function(func.name(), args, rets, ud, read_file_impl)
            },
            HostFunction::WriteFile => {
                builder.with_function(func.name(), args, rets, ud, write_file_impl)
            },
            HostFunction::HttpRequest => {
                builder.with_function(func.name(), args, rets, ud, http_request_impl)
            },
            HostFunction::RunTool => {
                builder.with_function(func.name(), args, rets, ud, run_tool_impl)
            },
            HostFunction::StoreEvidence => {
                builder.with_function(func.name(), args, rets, ud, store_evidence_impl)
            },
        };
    }
    builder
}

// ---------------------------------------------------------------------------
// Guest memory helpers
// ---------------------------------------------------------------------------

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn checked_handle(plugin: &mut CurrentPlugin, val: &Val, limit: u64) -> Result<Val, Error> {
    let ptr = match val {
        Val::I64(v) => *v as u64,
        Val::I32(v) => u64::from(*v as u32),
        _ => return Err(Error::msg("expected memory pointer value")),
    };
    let len = plugin.memory_length(ptr)?;
    if len > limit {
        return Err(Error::msg(format!(
            "argument of {len} bytes exceeds the {limit} byte limit"
        )));
    }
    Ok(Val::I64(ptr as i64))
}

fn guest_string(plugin: &mut CurrentPlugin, val: &Val, limit: u64) -> Result<String, Error> {
    let val = checked_handle(plugin, val, limit)?;
    plugin.memory_get_val(&val)
}

fn guest_bytes(plugin: &mut CurrentPlugin, val: &Val, limit: u64) -> Result<Vec<u8>, Error> {
    let val = checked_handle(plugin, val, limit)?;
    plugin.memory_get_val(&val)
}

fn return_bytes(
    plugin: &mut CurrentPlugin,
    outputs: &mut [Val],
    bytes: impl AsRef<[u8]>,
) -> Result<(), Error> {
    let mem = plugin.memory_new(bytes.as_ref())?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

fn return_json<T: Serialize>(
    plugin: &mut CurrentPlugin,
    outputs: &mut [Val],
    value: &T,
) -> Result<(), Error> {
    let json = serde_json::to_vec(value)
        .map_err(|e| Error::msg(format!("failed to encode host result: {e}")))?;
    return_bytes(plugin, outputs, json)
}

/// Context, call token and runtime for the call in progress.
fn bound(
    user_data: &UserData<HostState>,
) -> Result<(Arc<ExecutionContext>, CancellationToken, Handle), Error> {
    let ud = user_data.get()?;
    let state = ud
        .lock()
        .map_err(|e| Error::msg(format!("host state lock poisoned: {e}")))?;
    let ctx = state
        .context
        .clone()
        .ok_or_else(|| Error::msg("execution context not bound"))?;
    Ok((ctx, state.cancel.clone(), state.runtime.clone()))
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

#[allow(clippy::needless_pass_by_value)]
fn log_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let level = guest_string(plugin, &inputs[0], 64)?;
    let message = guest_string(plugin, &inputs[1], MAX_LOG_MESSAGE_LEN)?;
    let (ctx, _, _) = bound(&user_data)?;

    let level = level.parse().unwrap_or(LogLevel::Info);
    ctx.logger().log(level, &message);
    Ok(())
}

#[allow(clippy::needless_pass_by_value)]
fn get_config_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let key = guest_string(plugin, &inputs[0], MAX_KEY_LEN)?;
    let (ctx, _, _) = bound(&user_data)?;

    match ctx.config().get(&key) {
        Some(value) => return_json(plugin, outputs, &value),
        None => return_bytes(plugin, outputs, b""),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn read_file_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let path = guest_string(plugin, &inputs[0], MAX_KEY_LEN * 4)?;
    let (ctx, _, runtime) = bound(&user_data)?;

    let data = runtime
        .block_on(ctx.files().read(&path))
        .map_err(|e| Error::msg(e.to_string()))?;
    return_bytes(plugin, outputs, data)
}

#[allow(clippy::needless_pass_by_value)]
fn write_file_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let path = guest_string(plugin, &inputs[0], MAX_KEY_LEN * 4)?;
    let data = guest_bytes(plugin, &inputs[1], MAX_PAYLOAD_LEN)?;
    let (ctx, _, runtime) = bound(&user_data)?;

    runtime
        .block_on(ctx.files().write(&path, &data))
        .map_err(|e| Error::msg(e.to_string()))
}

/// Response shape handed to guests. The body is lossy UTF-8.
#[derive(Serialize)]
struct GuestHttpResponse {
    status: u16,
    headers: std::collections::BTreeMap<String, String>,
    body: String,
}

#[allow(clippy::needless_pass_by_value)]
fn http_request_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let json = guest_string(plugin, &inputs[0], MAX_JSON_ARG_LEN)?;
    let request: HttpRequest = serde_json::from_str(&json)
        .map_err(|e| Error::msg(format!("invalid HTTP request JSON: {e}")))?;
    let (ctx, _, runtime) = bound(&user_data)?;

    let response = runtime
        .block_on(ctx.network().send(request))
        .map_err(|e| Error::msg(e.to_string()))?;
    let body = response.text();
    return_json(
        plugin,
        outputs,
        &GuestHttpResponse {
            status: response.status,
            headers: response.headers,
            body,
        },
    )
}

#[derive(Deserialize)]
struct ToolInvocation {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

#[allow(clippy::needless_pass_by_value)]
fn run_tool_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let json = guest_string(plugin, &inputs[0], MAX_JSON_ARG_LEN)?;
    let invocation: ToolInvocation = serde_json::from_str(&json)
        .map_err(|e| Error::msg(format!("invalid tool invocation JSON: {e}")))?;
    let (ctx, cancel, runtime) = bound(&user_data)?;

    let output = runtime
        .block_on(
            ctx.processes()
                .run(&invocation.program, &invocation.args, &cancel),
        )
        .map_err(|e| Error::msg(e.to_string()))?;
    return_json(plugin, outputs, &output)
}

#[allow(clippy::needless_pass_by_value)]
fn store_evidence_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let key = guest_string(plugin, &inputs[0], MAX_KEY_LEN)?;
    let data = guest_bytes(plugin, &inputs[1], MAX_PAYLOAD_LEN)?;
    let (ctx, _, runtime) = bound(&user_data)?;

    let record = runtime
        .block_on(ctx.evidence().store(&key, data))
        .map_err(|e| Error::msg(e.to_string()))?;
    return_json(plugin, outputs, &record)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn host_function_names_are_unique_and_prefixed() {
        let names: BTreeSet<&str> = HostFunction::ALL.iter().map(|f| f.name()).collect();
        assert_eq!(names.len(), HostFunction::ALL.len());
        assert!(names.iter().all(|n| n.starts_with("lantern_")));
    }

    #[test]
    fn void_functions_take_two_arguments() {
        for func in [HostFunction::Log, HostFunction::WriteFile] {
            assert!(!func.returns_value());
            assert_eq!(func.arg_count(), 2);
        }
        assert!(HostFunction::StoreEvidence.returns_value());
    }
}
