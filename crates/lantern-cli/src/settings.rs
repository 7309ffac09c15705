//! Configuration and logging setup shared by every command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use lantern_config::{Config, LoadOptions};
use lantern_plugins::{NativeModuleRegistry, PluginManager};
use lantern_storage::FsEvidenceStore;
use lantern_telemetry::{LogConfig, LogFormat};
use tokio_util::sync::CancellationToken;

/// Load the layered configuration, with `explicit` merged on top.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut options = LoadOptions::new();
    if let Ok(cwd) = std::env::current_dir() {
        options = options.with_workspace_root(cwd);
    }
    if let Some(path) = explicit {
        options = options.with_explicit_file(path);
    }
    Config::load_with(&options).context("failed to load configuration")
}

/// Install the global subscriber. `--verbose` forces `debug`; `--log-format`
/// overrides `[logging].format`.
pub(crate) fn init_logging(config: &Config, verbose: bool, format: Option<&str>) {
    let mut log_config = LogConfig::from_config(&config.logging)
        .unwrap_or_else(|_| LogConfig::new("info").with_format(LogFormat::Compact));
    if verbose {
        "debug".clone_into(&mut log_config.level);
    }
    if let Some(format) = format {
        match format.parse() {
            Ok(format) => log_config = log_config.with_format(format),
            Err(e) => eprintln!("Ignoring --log-format: {e}"),
        }
    }
    if let Err(e) = lantern_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }
}

/// Built-in native modules.
pub(crate) fn native_modules() -> NativeModuleRegistry {
    let mut registry = NativeModuleRegistry::new();
    lantern_plugin_hash::register(&mut registry);
    registry
}

/// A manager configured from `config` with the built-in modules.
pub(crate) async fn manager(config: &Config) -> Result<PluginManager> {
    let mut builder = PluginManager::from_config(config).native_modules(native_modules());
    if let Some(root) = &config.evidence.root {
        let store = FsEvidenceStore::open(root)
            .await
            .with_context(|| format!("failed to open evidence root {}", root.display()))?;
        builder = builder.evidence_store(Arc::new(store));
    }
    Ok(builder.build())
}

/// `dir`, or `plugins.directory` when absent.
pub(crate) fn plugin_dir(config: &Config, dir: Option<PathBuf>) -> Result<PathBuf> {
    dir.or_else(|| config.plugins.directory.clone()).context(
        "no directory given and plugins.directory is not configured",
    )
}

/// A token cancelled on Ctrl-C.
pub(crate) fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; cancelling");
            trigger.cancel();
        }
    });
    token
}
