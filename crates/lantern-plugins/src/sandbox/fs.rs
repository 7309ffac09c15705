//! Allow-listed file access.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::Liveness;
use super::policy::AllowedRoot;
use crate::error::{PluginError, PluginResult};

/// Largest file a plugin may read in one call.
const MAX_READ_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// File accessor confined to a set of [`AllowedRoot`]s.
///
/// Relative paths resolve against the plugin's working directory. Every
/// path is resolved physically (symlinks followed, `..` applied by the OS)
/// before the bound check, so neither `../` segments nor planted symlinks
/// can escape a root.
#[derive(Debug, Clone)]
pub struct RestrictedFileAccessor {
    roots: Vec<AllowedRoot>,
    base: PathBuf,
    liveness: Liveness,
}

impl RestrictedFileAccessor {
    pub(crate) fn new(roots: Vec<AllowedRoot>, base: PathBuf, liveness: Liveness) -> Self {
        let roots = roots
            .into_iter()
            .map(|root| AllowedRoot {
                path: root.path.canonicalize().unwrap_or(root.path),
                ..root
            })
            .collect();
        Self {
            roots,
            base,
            liveness,
        }
    }

    /// Roots this accessor permits.
    #[must_use]
    pub fn roots(&self) -> &[AllowedRoot] {
        &self.roots
    }

    /// Read a whole file.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] outside the allow-list or without a
    /// read grant; [`PluginError::Io`] if the read fails.
    pub async fn read(&self, path: impl AsRef<Path>) -> PluginResult<Vec<u8>> {
        let resolved = self.resolve(path.as_ref(), Access::Read)?;
        let len = tokio::fs::metadata(&resolved).await?.len();
        if len > MAX_READ_BYTES {
            return Err(PluginError::denied(
                path.as_ref().display().to_string(),
                format!("file is {len} bytes, exceeding the {MAX_READ_BYTES} byte read limit"),
            ));
        }
        Ok(tokio::fs::read(&resolved).await?)
    }

    /// Read a UTF-8 file.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read), plus [`PluginError::ExecutionFailure`] for
    /// invalid UTF-8.
    pub async fn read_to_string(&self, path: impl AsRef<Path>) -> PluginResult<String> {
        let bytes = self.read(path.as_ref()).await?;
        String::from_utf8(bytes).map_err(|_| {
            PluginError::ExecutionFailure(format!(
                "{} is not valid UTF-8",
                path.as_ref().display()
            ))
        })
    }

    /// Write a file, creating parent directories inside the root.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] outside the allow-list or without a
    /// write grant; [`PluginError::Io`] if the write fails.
    pub async fn write(&self, path: impl AsRef<Path>, data: &[u8]) -> PluginResult<()> {
        let resolved = self.resolve(path.as_ref(), Access::Write)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, data).await?;
        debug!(path = %resolved.display(), bytes = data.len(), "Plugin wrote file");
        Ok(())
    }

    /// Whether a path exists. Requires read access to the path.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] outside the allow-list.
    pub async fn exists(&self, path: impl AsRef<Path>) -> PluginResult<bool> {
        let resolved = self.resolve(path.as_ref(), Access::Read)?;
        Ok(tokio::fs::try_exists(&resolved).await?)
    }

    /// Entry names in a directory, sorted.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] outside the allow-list;
    /// [`PluginError::Io`] if the directory cannot be read.
    pub async fn list_dir(&self, path: impl AsRef<Path>) -> PluginResult<Vec<String>> {
        let resolved = self.resolve(path.as_ref(), Access::Read)?;
        let mut entries = tokio::fs::read_dir(&resolved).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Resolve `requested` for a read, without performing it.
    ///
    /// # Errors
    ///
    /// [`PluginError::ResourceDenied`] if the path is outside the allow-list.
    pub fn resolve_for_read(&self, requested: &Path) -> PluginResult<PathBuf> {
        self.resolve(requested, Access::Read)
    }

    fn resolve(&self, requested: &Path, access: Access) -> PluginResult<PathBuf> {
        let shown = requested.display().to_string();
        self.liveness.check(&shown)?;

        let resolved = self.resolve_physical(requested).ok_or_else(|| {
            PluginError::denied(&shown, "path cannot be resolved inside the sandbox")
        })?;

        let mut covered = false;
        for root in self.roots.iter().filter(|r| resolved.starts_with(&r.path)) {
            covered = true;
            let granted = match access {
                Access::Read => root.read,
                Access::Write => root.write,
            };
            if granted {
                return Ok(resolved);
            }
        }

        let reason = match (covered, access) {
            (false, _) => "path is outside the plugin's allowed roots",
            (true, Access::Read) => "read access not granted for this path",
            (true, Access::Write) => "write access not granted for this path",
        };
        Err(PluginError::denied(shown, reason))
    }

    /// Canonicalize the deepest existing ancestor and re-append the missing
    /// tail. `None` if no ancestor exists, the tail contains `..`, or an
    /// existing entry cannot be canonicalized (dangling symlink).
    fn resolve_physical(&self, requested: &Path) -> Option<PathBuf> {
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.base.join(requested)
        };

        let mut existing = joined.as_path();
        let mut missing = Vec::new();
        while std::fs::symlink_metadata(existing).is_err() {
            // `file_name` is `None` for a trailing `..`, which cannot be
            // resolved without the directory existing.
            missing.push(existing.file_name()?);
            existing = existing.parent()?;
        }

        let mut resolved = existing.canonicalize().ok()?;
        for component in missing.into_iter().rev() {
            resolved.push(component);
        }
        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        work: PathBuf,
        scratch: PathBuf,
        outside: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let scratch = tmp.path().join("scratch");
        let outside = tmp.path().join("outside");
        for dir in [&work, &scratch, &outside] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(outside.join("secret.txt"), b"secret").unwrap();
        std::fs::write(work.join("sample.bin"), b"sample").unwrap();
        Fixture {
            _tmp: tmp,
            work,
            scratch,
            outside,
        }
    }

    fn accessor(f: &Fixture, roots: Vec<AllowedRoot>) -> RestrictedFileAccessor {
        RestrictedFileAccessor::new(roots, f.work.clone(), Liveness::default())
    }

    #[tokio::test]
    async fn reads_relative_and_absolute_inside_root() {
        let f = fixture();
        let files = accessor(&f, vec![AllowedRoot::read_only(&f.work)]);
        assert_eq!(files.read("sample.bin").await.unwrap(), b"sample");
        assert_eq!(files.read(f.work.join("sample.bin")).await.unwrap(), b"sample");
    }

    #[tokio::test]
    async fn denies_outside_paths_and_traversal() {
        let f = fixture();
        let files = accessor(&f, vec![AllowedRoot::read_write(&f.work)]);

        for path in [
            f.outside.join("secret.txt"),
            PathBuf::from("../outside/secret.txt"),
            PathBuf::from("./nested/../../outside/secret.txt"),
            PathBuf::from("/etc/passwd"),
        ] {
            let err = files.read(&path).await.unwrap_err();
            assert!(
                matches!(err, PluginError::ResourceDenied { .. }),
                "{} gave {err}",
                path.display()
            );
        }

        let err = files
            .write("../outside/dropped.txt", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ResourceDenied { .. }));
        assert!(!f.outside.join("dropped.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_denied() {
        let f = fixture();
        std::os::unix::fs::symlink(&f.outside, f.work.join("link")).unwrap();
        let files = accessor(&f, vec![AllowedRoot::read_write(&f.work)]);

        assert!(files.read("link/secret.txt").await.is_err());
        assert!(files.write("link/new.txt", b"x").await.is_err());
        assert!(!f.outside.join("new.txt").exists());
    }

    #[tokio::test]
    async fn write_requires_write_grant() {
        let f = fixture();
        let files = accessor(&f, vec![AllowedRoot::read_only(&f.work)]);
        let err = files.write("out.txt", b"x").await.unwrap_err();
        assert!(err.to_string().contains("write access not granted"), "{err}");

        let files = accessor(&f, vec![AllowedRoot::read_write(&f.work)]);
        files.write("reports/out.txt", b"x").await.unwrap();
        assert_eq!(std::fs::read(f.work.join("reports/out.txt")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn multiple_roots() {
        let f = fixture();
        let files = accessor(
            &f,
            vec![
                AllowedRoot::read_only(&f.work),
                AllowedRoot::read_write(&f.scratch),
            ],
        );
        files.write(f.scratch.join("t.txt"), b"t").await.unwrap();
        assert!(files.exists(f.scratch.join("t.txt")).await.unwrap());
        assert_eq!(files.list_dir(".").await.unwrap(), vec!["sample.bin"]);
    }

    #[tokio::test]
    async fn no_roots_denies_everything() {
        let f = fixture();
        let files = accessor(&f, Vec::new());
        assert!(files.read("sample.bin").await.is_err());
    }

    #[tokio::test]
    async fn revoked_accessor_denies() {
        let f = fixture();
        let liveness = Liveness::default();
        let files = RestrictedFileAccessor::new(
            vec![AllowedRoot::read_only(&f.work)],
            f.work.clone(),
            liveness.clone(),
        );
        liveness.revoke();
        let err = files.read("sample.bin").await.unwrap_err();
        assert!(err.to_string().contains("execution context disposed"));
    }
}
