#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Layered configuration for the Lantern plugin runtime.
//!
//! # Usage
//!
//! ```rust,no_run
//! use lantern_config::Config;
//!
//! // defaults → system → user → workspace → env
//! let config = Config::load(Some(std::path::Path::new("."))).unwrap();
//! println!("rate ceiling: {}/min", config.sandbox.requests_per_minute);
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment** (`LANTERN_*`)
//! 2. **Explicit file** (`--config`)
//! 3. **Workspace** (`{workspace}/.lantern/config.toml`)
//! 4. **User** (`~/.lantern/config.toml`)
//! 5. **System** (`/etc/lantern/config.toml`)
//! 6. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! # Design
//!
//! This crate has **no dependencies on other internal lantern crates**.
//! Conversion into runtime settings happens at the integration boundary.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layered configuration merging.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::LoadOptions;
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(workspace_root: Option<&std::path::Path>) -> ConfigResult<Self> {
        let mut options = LoadOptions::new();
        if let Some(root) = workspace_root {
            options = options.with_workspace_root(root);
        }
        loader::load(&options)
    }

    /// Load configuration with explicit options.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load_with(options: &LoadOptions) -> ConfigResult<Self> {
        loader::load(options)
    }

    /// Load configuration from a single file (no layering).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
