//! Test harness utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lantern_plugins::{ManagerSettings, NativeModuleRegistry, PluginManager, SandboxSettings};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Set up test logging with the given filter.
///
/// Safe to call from every test; only the first call installs a subscriber.
///
/// ```rust,ignore
/// use lantern_test::setup_test_logging;
///
/// #[test]
/// fn my_test() {
///     setup_test_logging("lantern_plugins=debug");
/// }
/// ```
pub fn setup_test_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

/// Set up test logging with default filter (warn level).
pub fn setup_test_logging_default() {
    setup_test_logging("warn");
}

/// Scratch directories for one test: `packages/`, `work/` and `tmp/` under
/// a temporary root that is removed on drop.
#[derive(Debug)]
pub struct TestContext {
    /// Temporary root.
    pub dir: TempDir,
}

impl TestContext {
    /// Create a new test context.
    ///
    /// # Panics
    ///
    /// If the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        for sub in ["packages", "work", "tmp"] {
            if let Err(e) = std::fs::create_dir_all(dir.path().join(sub)) {
                panic!("failed to create {sub}: {e}");
            }
        }
        Self { dir }
    }

    /// Root of the context.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where fixtures write packages.
    #[must_use]
    pub fn packages(&self) -> PathBuf {
        self.dir.path().join("packages")
    }

    /// Manager working-directory root.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    /// Sandbox temp root.
    #[must_use]
    pub fn temp_root(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    /// Number of entries under [`work_dir`](Self::work_dir).
    #[must_use]
    pub fn work_dir_entries(&self) -> usize {
        std::fs::read_dir(self.work_dir()).map_or(0, Iterator::count)
    }

    /// Manager settings rooted in this context, with short drain and hook
    /// budgets.
    #[must_use]
    pub fn settings(&self) -> ManagerSettings {
        ManagerSettings::default()
            .with_work_dir(self.work_dir())
            .with_plugin_dir(self.packages())
            .with_drain_timeout(Duration::from_secs(2))
            .with_initialize_timeout(Duration::from_secs(5))
    }

    /// A manager over `native`, rooted in this context.
    #[must_use]
    pub fn manager(&self, native: NativeModuleRegistry) -> PluginManager {
        PluginManager::builder()
            .settings(self.settings())
            .sandbox_settings(SandboxSettings::default().with_temp_root(self.temp_root()))
            .native_modules(native)
            .build()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
