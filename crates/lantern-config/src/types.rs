//! Configuration types for the Lantern runtime.
//!
//! All types here are self-contained; the plugin runtime converts them into
//! its own settings at the boundary. Every struct implements [`Default`] with
//! the same values as `defaults.toml`, so a bare `[section]` header produces a
//! working configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the Lantern runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin admission and lifecycle.
    pub plugins: PluginsSection,
    /// Brokered resource limits for sandboxed plugins.
    pub sandbox: SandboxSection,
    /// Host evidence store location.
    pub evidence: EvidenceSection,
    /// Intent routing.
    pub orchestrator: OrchestratorSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
    /// Free-form per-plugin settings, keyed by plugin id.
    ///
    /// Exposed read-only to each plugin through its configuration view.
    pub settings: BTreeMap<String, toml::Table>,
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Plugin admission policy and lifecycle timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directory scanned for plugin packages.
    pub directory: Option<PathBuf>,
    /// Root under which each loaded plugin gets a private working directory.
    /// Defaults to `<tmp>/lantern/work`.
    pub work_dir: Option<PathBuf>,
    /// Permissions the deployment is willing to grant. A plugin's approved
    /// set is its request intersected with this list.
    pub allowed_permissions: Vec<String>,
    /// Reject unsigned packages instead of warning.
    pub require_signatures: bool,
    /// Base64 Ed25519 public keys whose signatures are trusted.
    pub trusted_keys: Vec<String>,
    /// Largest package archive accepted, in bytes.
    pub max_package_bytes: u64,
    /// Budget for a plugin's initialize and self-check hooks.
    pub initialize_timeout_secs: u64,
    /// How long unload waits for in-flight executions before cancelling them.
    pub drain_timeout_secs: u64,
    /// Concurrent executions allowed per plugin instance.
    pub max_concurrent_executions: u32,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            directory: None,
            work_dir: None,
            allowed_permissions: [
                "filesystem.read",
                "filesystem.write",
                "network.api",
                "evidence.read",
                "evidence.write",
                "tools.forensics",
                "tools.network",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            require_signatures: false,
            trusted_keys: Vec::new(),
            max_package_bytes: 100 * 1024 * 1024,
            initialize_timeout_secs: 30,
            drain_timeout_secs: 30,
            max_concurrent_executions: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxSection
// ---------------------------------------------------------------------------

/// Limits applied to every plugin's brokered resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Host temp root. Each plugin gets a private subdirectory here.
    /// Defaults to `<tmp>/lantern/sandbox`.
    pub temp_root: Option<PathBuf>,
    /// Outbound requests allowed per plugin per minute, across all domains.
    pub requests_per_minute: u32,
    /// Wall-clock ceiling for an external tool invocation.
    pub process_timeout_secs: u64,
    /// Largest HTTP response body a plugin may receive.
    pub max_http_response_bytes: u64,
    /// Linear memory ceiling for WASM plugins.
    pub wasm_max_memory_bytes: u64,
    /// Execution budget when neither request nor plugin specifies one.
    pub default_execution_timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            temp_root: None,
            requests_per_minute: 60,
            process_timeout_secs: 300,
            max_http_response_bytes: 10 * 1024 * 1024,
            wasm_max_memory_bytes: 64 * 1024 * 1024,
            default_execution_timeout_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// EvidenceSection
// ---------------------------------------------------------------------------

/// Host evidence store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceSection {
    /// Evidence root directory. When unset, evidence is kept in memory and
    /// `evidence.read` grants no extra file access.
    pub root: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// OrchestratorSection
// ---------------------------------------------------------------------------

/// Intent routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Per-plugin budget for a routed query when the query sets none.
    pub default_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level: `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    /// Output format: `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Extra `EnvFilter` directives, e.g. `lantern_plugins=debug`.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}
