//! Plugin trait and core types.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{PluginError, PluginResult};
use crate::request::{PluginRequest, PluginResponse};
use crate::sandbox::ExecutionContext;

/// Maximum length of a plugin ID.
const MAX_ID_LEN: usize = 128;

/// Unique reverse-domain plugin identifier, e.g. `com.lantern.hash-analyzer`.
///
/// IDs have at least two dot-separated segments; each segment is non-empty
/// and made of ASCII letters, digits, `-` and `_`. Comparison is
/// case-sensitive. A valid ID is always a safe single path component, which
/// the manager relies on when naming working directories and evidence
/// namespaces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PluginId(String);

/// Deserialize with validation so a crafted manifest cannot smuggle a
/// traversal payload in as an ID.
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the ID is malformed.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `PluginId` without validation (for tests and constants).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a string is a valid plugin ID without constructing one.
    #[must_use]
    pub fn is_valid_id(id: &str) -> bool {
        Self::validate(id).is_ok()
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidId("plugin id must not be empty".into()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(PluginError::InvalidId(format!(
                "plugin id exceeds {MAX_ID_LEN} characters"
            )));
        }
        let segments: Vec<&str> = id.split('.').collect();
        if segments.len() < 2 {
            return Err(PluginError::InvalidId(format!(
                "plugin id must be reverse-domain (e.g. com.example.tool), got: {id}"
            )));
        }
        for segment in segments {
            if segment.is_empty() {
                return Err(PluginError::InvalidId(format!(
                    "plugin id has an empty segment: {id}"
                )));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(PluginError::InvalidId(format!(
                    "plugin id segments may only contain ASCII letters, digits, '-' and '_', got: {id}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The lifecycle state of a plugin identity, as tracked by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum PluginState {
    /// Not loaded.
    Unloaded,
    /// Package is being checked by the validator.
    Validating,
    /// Package passed validation; module and context are being built.
    Loading,
    /// Registered and serving executions.
    Loaded,
    /// Being torn down.
    Unloading,
    /// The most recent load attempt failed.
    Failed(String),
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => f.write_str("unloaded"),
            Self::Validating => f.write_str("validating"),
            Self::Loading => f.write_str("loading"),
            Self::Loaded => f.write_str("loaded"),
            Self::Unloading => f.write_str("unloading"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Runtime posture declared by the plugin object itself.
///
/// This may differ from what the manifest requests. The manager intersects
/// the two at load time: it never grants more than the manifest asked for
/// and policy allows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    /// Needs outbound network access.
    pub requires_network: bool,
    /// Needs elevated host privilege. Never granted.
    pub requires_elevated_privilege: bool,
    /// Needs a GPU or other accelerator.
    pub requires_accelerator: bool,
    /// Memory ceiling in bytes.
    pub max_memory_bytes: Option<u64>,
    /// Default execution timeout in milliseconds.
    pub default_timeout_ms: Option<u64>,
    /// Intents this implementation can service. Empty means "whatever the
    /// manifest declares".
    pub supported_intents: BTreeSet<String>,
    /// File types the plugin understands (extensions or MIME types).
    pub supported_file_types: BTreeSet<String>,
}

impl Capabilities {
    /// Empty capabilities: no network, no privilege, no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a need for outbound network access.
    #[must_use]
    pub fn with_network(mut self) -> Self {
        self.requires_network = true;
        self
    }

    /// Declare a need for elevated privilege.
    #[must_use]
    pub fn with_elevated_privilege(mut self) -> Self {
        self.requires_elevated_privilege = true;
        self
    }

    /// Declare a need for an accelerator.
    #[must_use]
    pub fn with_accelerator(mut self) -> Self {
        self.requires_accelerator = true;
        self
    }

    /// Set the memory ceiling.
    #[must_use]
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Set the default execution timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Add a supported intent.
    #[must_use]
    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.supported_intents.insert(intent.into());
        self
    }

    /// Add a supported file type.
    #[must_use]
    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.supported_file_types.insert(file_type.into());
        self
    }

    /// Default execution timeout, if declared.
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// The contract every plugin implementation fulfils.
///
/// The manager drives the lifecycle: `initialize` once with the sandboxed
/// context, `validate` once as a self-check, any number of concurrent
/// `execute` calls, then `dispose` once. An instance is never reused after
/// `dispose`.
///
/// `execute` takes `&self` and may be called concurrently; implementations
/// that are not reentrant must serialize internally.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Runtime posture. Called after construction and before `initialize`.
    fn capabilities(&self) -> Capabilities;

    /// Bind the plugin to its execution context and acquire resources.
    async fn initialize(&mut self, ctx: Arc<ExecutionContext>) -> PluginResult<()>;

    /// Self-check run after `initialize`. A failure aborts the load.
    async fn validate(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Service one request. Should return promptly once `cancel` fires.
    async fn execute(
        &self,
        request: PluginRequest,
        cancel: CancellationToken,
    ) -> PluginResult<PluginResponse>;

    /// Release resources. Called once during unload.
    async fn dispose(&self) -> PluginResult<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}
