//! Plugins compiled into the host binary.
//!
//! A package ships a `*.native` descriptor instead of code:
//!
//! ```json
//! { "symbol": "lantern.hash-analyzer" }
//! ```
//!
//! The symbol is looked up in the [`NativeModuleRegistry`] the host filled
//! at start-up. Descriptors naming an unregistered symbol are ignored by the
//! loader, exactly like a WASM module without the entry export.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::error::{PluginError, PluginResult};
use crate::plugin::Plugin;

/// Builds a fresh, uninitialized plugin instance.
pub type NativeFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Contents of a `*.native` module file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NativeDescriptor {
    /// Registration symbol.
    pub symbol: String,
}

impl NativeDescriptor {
    /// Parse a descriptor file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NoPluginImplementationFound`] if the bytes are
    /// not a descriptor.
    pub fn parse(bytes: &[u8]) -> PluginResult<Self> {
        let descriptor: Self = serde_json::from_slice(bytes).map_err(|e| {
            PluginError::NoPluginImplementationFound {
                message: format!("invalid native module descriptor: {e}"),
            }
        })?;
        if descriptor.symbol.trim().is_empty() {
            return Err(PluginError::NoPluginImplementationFound {
                message: "native module descriptor has an empty symbol".into(),
            });
        }
        Ok(descriptor)
    }
}

/// Symbol table of plugins linked into the host.
#[derive(Clone, Default)]
pub struct NativeModuleRegistry {
    factories: BTreeMap<String, NativeFactory>,
}

impl NativeModuleRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `symbol`, replacing any earlier registration.
    pub fn register<F>(&mut self, symbol: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let symbol = symbol.into();
        if self
            .factories
            .insert(symbol.clone(), Arc::new(factory))
            .is_some()
        {
            warn!(symbol = %symbol, "Native module symbol registered twice, keeping the latest");
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, symbol: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(symbol, factory);
        self
    }

    /// Whether `symbol` is registered.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.factories.contains_key(symbol)
    }

    /// Registered symbols, sorted.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub(crate) fn resolve(&self, symbol: &str) -> Option<NativeFactory> {
        self.factories.get(symbol).cloned()
    }
}

impl fmt::Debug for NativeModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModuleRegistry")
            .field("symbols", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
