//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/lantern/config.toml` (system)
//! 3. Merge `~/.lantern/config.toml` (user)
//! 4. Merge `{workspace}/.lantern/config.toml` (workspace)
//! 5. Merge an explicitly named file, if any
//! 6. Apply `LANTERN_*` overrides
//! 7. Deserialize merged tree → `Config`
//! 8. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, deep_merge};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Default system-wide config location.
const SYSTEM_CONFIG_PATH: &str = "/etc/lantern/config.toml";

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Inputs to [`load`]. Every source is optional so tests can isolate layers.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    system_file: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    workspace_root: Option<PathBuf>,
    explicit_file: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            system_file: Some(PathBuf::from(SYSTEM_CONFIG_PATH)),
            home_dir: None,
            workspace_root: None,
            explicit_file: None,
            env: None,
        }
    }
}

impl LoadOptions {
    /// Options for the standard precedence chain rooted at `workspace_root`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override (or with `None`, skip) the system-wide config file.
    #[must_use]
    pub fn with_system_file(mut self, path: Option<PathBuf>) -> Self {
        self.system_file = path;
        self
    }

    /// Use `home` instead of the OS home directory for the user layer.
    #[must_use]
    pub fn with_home_dir(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home.into());
        self
    }

    /// Include `{root}/.lantern/config.toml` as the workspace layer.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Merge an explicitly named file above the workspace layer.
    #[must_use]
    pub fn with_explicit_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    /// Use `env` instead of the process environment for overrides.
    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

/// Load the configuration with layered file precedence.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, or if the
/// final merged configuration fails validation.
pub fn load(options: &LoadOptions) -> ConfigResult<Config> {
    let env_vars = options.env.clone().unwrap_or_else(collect_env_vars);

    // 1. Embedded defaults.
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut loaded_files = 0usize;

    // 2. System config.
    if let Some(system_path) = &options.system_file {
        merge_file(
            &mut merged,
            system_path,
            &ConfigLayer::System,
            &mut loaded_files,
        )?;
    }

    // 3. User config.
    let home_dir = match &options.home_dir {
        Some(h) => Some(h.clone()),
        None => home_directory().ok(),
    };
    if let Some(home) = home_dir {
        let user_path = home.join(".lantern").join("config.toml");
        merge_file(
            &mut merged,
            &user_path,
            &ConfigLayer::User,
            &mut loaded_files,
        )?;
    } else {
        debug!("no home directory; skipping user config");
    }

    // 4. Workspace config.
    if let Some(ws_root) = &options.workspace_root {
        let ws_path = ws_root.join(".lantern").join("config.toml");
        merge_file(
            &mut merged,
            &ws_path,
            &ConfigLayer::Workspace,
            &mut loaded_files,
        )?;
    }

    // 5. Explicit file must exist.
    if let Some(explicit) = &options.explicit_file {
        let found = merge_file(
            &mut merged,
            explicit,
            &ConfigLayer::Explicit,
            &mut loaded_files,
        )?;
        if !found {
            return Err(ConfigError::ReadError {
                path: explicit.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
    }

    // 6. Environment overrides.
    let env_count = apply_env_overrides(&mut merged, &env_vars);
    if env_count > 0 {
        debug!(count = env_count, "applied environment overrides");
    }

    // 7. Deserialize.
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    // 8. Validate.
    validate::validate(&config)?;
    debug!(files = loaded_files, "configuration resolved");

    Ok(config)
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let value = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Merge `path` into `merged` if it exists. Returns whether it was found.
fn merge_file(
    merged: &mut toml::Value,
    path: &Path,
    layer: &ConfigLayer,
    loaded_files: &mut usize,
) -> ConfigResult<bool> {
    let Some(overlay) = try_load_file(path)? else {
        return Ok(false);
    };
    deep_merge(merged, &overlay);
    *loaded_files = loaded_files.saturating_add(1);
    info!(path = %path.display(), layer = %layer, "loaded config");
    Ok(true)
}

/// Try to load a file, returning `None` if the file doesn't exist.
///
/// A single read avoids a TOCTOU window between stat and read.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
