//! Package discovery: locate packages and read their manifests. No plugin
//! code runs here.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PluginResult;
use crate::package::{PackageArchive, is_package_path};
use crate::plugin::PluginId;

/// A package found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPlugin {
    /// Package file.
    pub path: PathBuf,
    /// Manifest identity.
    pub id: PluginId,
    /// Manifest display name.
    pub name: String,
    /// Manifest version.
    pub version: semver::Version,
    /// Whether a plugin with this identity is currently loaded.
    pub loaded: bool,
}

/// Scan `dir` (not recursively) for packages and read each manifest.
///
/// Files that cannot be read or whose manifest does not parse are logged
/// and skipped. Results are sorted by path; `loaded` is always `false`.
///
/// # Errors
///
/// Returns [`PluginError::Io`](crate::PluginError::Io) if `dir` cannot be
/// listed.
pub async fn discover(dir: &Path, max_package_bytes: u64) -> PluginResult<Vec<DiscoveredPlugin>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_package_path(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut found = Vec::with_capacity(paths.len());
    for path in paths {
        let manifest = match PackageArchive::open(&path, max_package_bytes).await {
            Ok(archive) => archive.manifest(),
            Err(e) => Err(e),
        };
        match manifest {
            Ok(manifest) => {
                debug!(package = %path.display(), plugin_id = %manifest.id, "Discovered package");
                found.push(DiscoveredPlugin {
                    path,
                    id: manifest.id,
                    name: manifest.name,
                    version: manifest.version,
                    loaded: false,
                });
            },
            Err(e) => {
                warn!(package = %path.display(), error = %e, "Skipping unreadable package");
            },
        }
    }
    Ok(found)
}
