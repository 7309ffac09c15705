//! Plugin runtime error types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::PluginId;

/// Errors from plugin runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The manifest is unparsable or misses a required field.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// The plugin ID is not a valid reverse-domain identifier.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// The validator rejected the package.
    #[error("package rejected by policy: {}", .errors.join("; "))]
    PolicyRejected {
        /// Every blocking finding, in check order.
        errors: Vec<String>,
    },

    /// The module has zero or several plugin-contract candidates.
    #[error("no plugin implementation found: {message}")]
    NoPluginImplementationFound {
        /// What was (or was not) found.
        message: String,
    },

    /// A plugin with this identity is already loaded.
    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(PluginId),

    /// No plugin with this identity is loaded.
    #[error("plugin not loaded: {0}")]
    NotLoaded(PluginId),

    /// The plugin's own logic failed.
    #[error("plugin execution failed: {0}")]
    ExecutionFailure(String),

    /// The sandbox refused access to a brokered resource.
    #[error("access denied to {resource}: {reason}")]
    ResourceDenied {
        /// The resource that was requested (path, URL, program, key).
        resource: String,
        /// Why it was refused.
        reason: String,
    },

    /// The plugin's initialize or self-check hook failed.
    #[error("plugin {plugin_id} failed to initialize: {message}")]
    InitializationFailed {
        /// The plugin that failed.
        plugin_id: PluginId,
        /// Failure reason.
        message: String,
    },

    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What timed out.
        operation: String,
        /// The budget that was exceeded.
        after: Duration,
    },

    /// An external tool ran past its wall-clock ceiling and was killed.
    #[error("process '{program}' killed after exceeding {after:?}")]
    ProcessTimeout {
        /// The program that was terminated.
        program: String,
        /// The ceiling it exceeded.
        after: Duration,
    },

    /// The caller cancelled the operation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Evidence store failure.
    #[error("evidence store error: {0}")]
    Storage(#[from] lantern_storage::StorageError),

    /// Archive extraction failure.
    #[error("extraction error: {message}")]
    ExtractionError {
        /// Description of the extraction failure.
        message: String,
    },

    /// Unsafe entry type in archive (symlink, hardlink, device node).
    #[error("unsafe archive entry type '{entry_type}' at {path}")]
    UnsafeEntryType {
        /// The entry type that was rejected.
        entry_type: String,
        /// The path of the entry.
        path: String,
    },

    /// Path traversal detected in an archive entry.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path.
        path: String,
    },

    /// Package exceeds the configured size ceiling.
    #[error("package too large: {size} bytes (limit: {limit} bytes)")]
    PackageTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        limit: u64,
    },

    /// Module bytes do not match the hash declared in the manifest.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest.
        actual: String,
    },

    /// WASM runtime error (Extism/Wasmtime).
    #[error("WASM error: {0}")]
    WasmError(String),

    /// Package signature could not be produced or checked.
    #[error("signature error: {0}")]
    Signature(String),

    /// No intent could be read out of a query.
    #[error("could not extract an intent: {0}")]
    IntentExtraction(String),

    /// Runtime configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<lantern_config::ConfigError> for PluginError {
    fn from(e: lantern_config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Coarse error category, stable across releases.
///
/// API and CLI layers report this alongside the message so callers can branch
/// on the failure class without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unparsable or incomplete manifest.
    MalformedManifest,
    /// Denied permission or structural defect in the package.
    PolicyRejected,
    /// Zero or multiple plugin-contract candidates.
    AmbiguousOrMissingImplementation,
    /// Duplicate identity.
    AlreadyLoaded,
    /// Unknown identity.
    NotLoaded,
    /// Failure inside plugin code (including init/self-check and timeouts).
    ExecutionFailure,
    /// Sandbox refusal.
    ResourceDenied,
    /// Host-side failure (I/O, storage, runtime).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MalformedManifest => "malformed_manifest",
            Self::PolicyRejected => "policy_rejected",
            Self::AmbiguousOrMissingImplementation => "ambiguous_or_missing_implementation",
            Self::AlreadyLoaded => "already_loaded",
            Self::NotLoaded => "not_loaded",
            Self::ExecutionFailure => "execution_failure",
            Self::ResourceDenied => "resource_denied",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl PluginError {
    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedManifest(_) | Self::InvalidId(_) => ErrorKind::MalformedManifest,
            Self::PolicyRejected { .. }
            | Self::ExtractionError { .. }
            | Self::UnsafeEntryType { .. }
            | Self::PathTraversal { .. }
            | Self::PackageTooLarge { .. }
            | Self::HashMismatch { .. }
            | Self::Signature(_) => ErrorKind::PolicyRejected,
            Self::NoPluginImplementationFound { .. } => {
                ErrorKind::AmbiguousOrMissingImplementation
            },
            Self::AlreadyLoaded(_) => ErrorKind::AlreadyLoaded,
            Self::NotLoaded(_) => ErrorKind::NotLoaded,
            Self::ExecutionFailure(_)
            | Self::InitializationFailed { .. }
            | Self::Timeout { .. }
            | Self::ProcessTimeout { .. }
            | Self::Cancelled(_)
            | Self::IntentExtraction(_) => ErrorKind::ExecutionFailure,
            Self::ResourceDenied { .. } => ErrorKind::ResourceDenied,
            Self::Io(_) | Self::Storage(_) | Self::WasmError(_) | Self::Config(_) => {
                ErrorKind::Internal
            },
        }
    }

    /// Shorthand for a [`PluginError::ResourceDenied`].
    pub(crate) fn denied(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceDenied {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;
