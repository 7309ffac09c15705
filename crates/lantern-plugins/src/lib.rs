//! Plugin runtime for the Lantern investigation platform.
//!
//! Third-party analysis capabilities are distributed as signed packages and
//! run inside the host under a permission-scoped sandbox:
//!
//! - [`PluginManifest`]: identity, permissions and declared intents
//! - [`PluginValidator`]: integrity and policy checks that never run plugin code
//! - [`ModuleLoader`]: finds the single plugin implementation in a package and
//!   gives it an isolated, releasable arena (Extism WASM or host-linked native)
//! - [`CapabilitySandbox`]: builds the [`ExecutionContext`] whose brokers gate
//!   file, network, process and evidence access on approved permissions
//! - [`PluginManager`]: the lifecycle state machine and the loaded-plugin
//!   registry, with draining unload
//! - [`IntentOrchestrator`]: routes a query's intent to every plugin that
//!   handles it and collects the results
//!
//! # Packages
//!
//! A package is a gzip-compressed tar archive holding `plugin.json` at its
//! root plus one or more modules (`*.wasm`, or `*.native` descriptors naming
//! a symbol in the host's [`NativeModuleRegistry`]).
//!
//! # Isolation
//!
//! Plugins never see the host filesystem, network or processes directly.
//! Every resource access goes through a broker on the execution context,
//! and every broker refuses once the plugin is unloaded.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod discovery;
pub mod error;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod orchestrator;
pub mod package;
pub mod plugin;
pub mod request;
pub mod sandbox;
pub mod signature;
pub mod validator;

pub use config::{ConfigSource, ConfigView, StaticConfigSource};
pub use discovery::DiscoveredPlugin;
pub use error::{ErrorKind, PluginError, PluginResult};
pub use loader::{
    DEFAULT_ENTRY_SYMBOL, ModuleHandle, ModuleKind, ModuleLoader, NativeModuleRegistry,
    ReleaseOutcome,
};
pub use manager::{
    ManagerSettings, OperationReport, PluginHandle, PluginInfo, PluginManager,
    PluginManagerBuilder,
};
pub use manifest::{EntryPoint, PluginManifest};
pub use orchestrator::{
    ExtractedIntent, FixedIntentExtractor, IntentExtractor, IntentOrchestrator,
    OrchestratorResult, PluginInvocation, QueryContext, ResultSynthesizer,
    StructuredQueryExtractor, SummarySynthesizer,
};
pub use package::PackageArchive;
pub use plugin::{Capabilities, Plugin, PluginId, PluginState};
pub use request::{Citation, PluginRequest, PluginResponse, SuggestedAction};
pub use sandbox::{CapabilitySandbox, ExecutionContext, SandboxSettings};
pub use validator::{PluginValidator, ValidationPolicy, ValidationResult};
