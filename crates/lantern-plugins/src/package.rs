//! Plugin package archives.
//!
//! A package is a gzip-compressed tar with `plugin.json` at its root and one
//! or more compiled modules. Archives are read fully into memory under hard
//! limits, so the validator can inspect them without touching the disk, and
//! only then written out to a working directory.
//!
//! Reading guards against:
//! - Path traversal (`../` components) and absolute paths
//! - Symlinks, hardlinks, device nodes and other non-regular entries
//! - Excessive entry counts and decompression bombs
//! - Duplicate entries shadowing each other

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::Archive;
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::manifest::{self, MANIFEST_FILE_NAME, PluginManifest};

/// Maximum number of entries allowed in a package.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total extracted size (500 MB).
const MAX_EXTRACTED_SIZE: u64 = 500_000_000;

/// Extensions recognized as loadable modules.
pub const MODULE_EXTENSIONS: &[&str] = &["wasm", "native"];

/// Subdirectory scanned for modules in addition to the package root.
pub const MODULES_DIR: &str = "modules";

/// Extensions recognized as package archives.
pub const PACKAGE_EXTENSIONS: &[&str] = &[".lpkg", ".tar.gz", ".tgz"];

/// Whether `path` names a package archive by extension.
#[must_use]
pub fn is_package_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| PACKAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)))
}

/// Whether a package-relative path is a module the loader would consider:
/// a `.wasm` or `.native` file at the root or directly under `modules/`.
#[must_use]
pub fn is_module_path(relative: &str) -> bool {
    let path = Path::new(relative);
    let has_module_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| MODULE_EXTENSIONS.contains(&ext));
    let location_ok = match path.parent() {
        None => true,
        Some(parent) => parent.as_os_str().is_empty() || parent == Path::new(MODULES_DIR),
    };
    has_module_ext && location_ok
}

/// A package archive read into memory.
#[derive(Debug, Clone)]
pub struct PackageArchive {
    source: PathBuf,
    compressed_size: u64,
    directories: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

impl PackageArchive {
    /// Read and check a package on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`PackageArchive::read`].
    pub async fn open(path: &Path, max_bytes: u64) -> PluginResult<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::read(&path, max_bytes))
            .await
            .map_err(|e| PluginError::ExtractionError {
                message: format!("archive reader task failed: {e}"),
            })?
    }

    /// Read and check a package.
    ///
    /// # Errors
    ///
    /// - [`PluginError::PackageTooLarge`] if the file exceeds `max_bytes`
    /// - [`PluginError::PathTraversal`] or [`PluginError::UnsafeEntryType`]
    ///   for malicious entries
    /// - [`PluginError::ExtractionError`] for anything else that makes the
    ///   archive unreadable, including an empty archive
    pub fn read(path: &Path, max_bytes: u64) -> PluginResult<Self> {
        let compressed_size = std::fs::metadata(path)?.len();
        if compressed_size > max_bytes {
            return Err(PluginError::PackageTooLarge {
                size: compressed_size,
                limit: max_bytes,
            });
        }
        let data = std::fs::read(path)?;
        let mut archive = Self::from_bytes(&data)?;
        archive.source = path.to_path_buf();
        Ok(archive)
    }

    /// Parse a package from compressed bytes.
    ///
    /// # Errors
    ///
    /// See [`PackageArchive::read`].
    pub fn from_bytes(data: &[u8]) -> PluginResult<Self> {
        let mut archive = Archive::new(GzDecoder::new(data));
        let mut directories = BTreeSet::new();
        let mut files = BTreeMap::new();
        let mut entry_count = 0usize;
        let mut total_size: u64 = 0;

        for entry_result in archive
            .entries()
            .map_err(|e| extraction(format!("failed to read archive entries: {e}")))?
        {
            let mut entry =
                entry_result.map_err(|e| extraction(format!("failed to read archive entry: {e}")))?;

            entry_count = entry_count.saturating_add(1);
            if entry_count > MAX_ENTRY_COUNT {
                return Err(extraction(format!(
                    "archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"
                )));
            }

            let entry_type = entry.header().entry_type();
            let raw_path = entry
                .path()
                .map_err(|e| extraction(format!("failed to read entry path: {e}")))?
                .into_owned();

            if !is_safe_entry_type(entry_type) {
                return Err(PluginError::UnsafeEntryType {
                    entry_type: format!("{entry_type:?}"),
                    path: raw_path.display().to_string(),
                });
            }

            let entry_size = entry
                .header()
                .size()
                .map_err(|e| extraction(format!("failed to read entry size: {e}")))?;
            total_size = total_size.saturating_add(entry_size);
            if total_size > MAX_EXTRACTED_SIZE {
                return Err(extraction(format!(
                    "archive exceeds maximum extracted size ({MAX_EXTRACTED_SIZE} bytes)"
                )));
            }

            let Some(relative) = normalize_entry_path(&raw_path)? else {
                // The archive root itself (`./`).
                continue;
            };

            match entry_type {
                tar::EntryType::Directory => {
                    directories.insert(relative);
                },
                tar::EntryType::Regular => {
                    let mut buf = Vec::new();
                    (&mut entry)
                        .take(entry_size)
                        .read_to_end(&mut buf)
                        .map_err(|e| extraction(format!("failed to read {relative}: {e}")))?;
                    if files.insert(relative.clone(), buf).is_some() {
                        return Err(extraction(format!("duplicate archive entry: {relative}")));
                    }
                },
                // Metadata headers carry nothing to extract.
                _ => {},
            }
        }

        if entry_count == 0 {
            return Err(extraction("archive is empty".into()));
        }

        Ok(Self {
            source: PathBuf::new(),
            compressed_size: u64::try_from(data.len()).unwrap_or(u64::MAX),
            directories,
            files,
        })
    }

    /// Path the archive was read from (empty for in-memory archives).
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Compressed size in bytes.
    #[must_use]
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Raw manifest bytes, if present at the archive root.
    #[must_use]
    pub fn manifest_bytes(&self) -> Option<&[u8]> {
        self.files.get(MANIFEST_FILE_NAME).map(Vec::as_slice)
    }

    /// Parse the root manifest.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedManifest`] if it is missing or invalid.
    pub fn manifest(&self) -> PluginResult<PluginManifest> {
        let bytes = self.manifest_bytes().ok_or_else(|| {
            PluginError::MalformedManifest(format!("{MANIFEST_FILE_NAME} not found at package root"))
        })?;
        manifest::parse(bytes)
    }

    /// Whether the archive contains a regular file at `relative`.
    #[must_use]
    pub fn contains(&self, relative: &str) -> bool {
        self.files.contains_key(relative)
    }

    /// Contents of a regular file.
    #[must_use]
    pub fn file(&self, relative: &str) -> Option<&[u8]> {
        self.files.get(relative).map(Vec::as_slice)
    }

    /// Every regular file except the root manifest, sorted by path.
    pub fn payload_files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files
            .iter()
            .filter(|(path, _)| path.as_str() != MANIFEST_FILE_NAME)
            .map(|(path, data)| (path.as_str(), data.as_slice()))
    }

    /// Module files the loader would consider, sorted by path.
    #[must_use]
    pub fn module_paths(&self) -> Vec<&str> {
        self.files
            .keys()
            .map(String::as_str)
            .filter(|p| is_module_path(p))
            .collect()
    }

    /// Write the package contents under `dest`, which must already exist.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PathTraversal`] if a resolved target escapes
    /// `dest`, or [`PluginError::ExtractionError`] on I/O failure.
    pub fn extract_to(&self, dest: &Path) -> PluginResult<()> {
        let dest = dest
            .canonicalize()
            .map_err(|e| extraction(format!("failed to canonicalize destination: {e}")))?;

        for dir in &self.directories {
            let target = dest.join(dir);
            std::fs::create_dir_all(&target)
                .map_err(|e| extraction(format!("failed to create directory {dir}: {e}")))?;
            ensure_within(&dest, &target, dir)?;
        }

        for (relative, data) in &self.files {
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    extraction(format!("failed to create directory {}: {e}", parent.display()))
                })?;
                ensure_within(&dest, parent, relative)?;
            }
            std::fs::write(&target, data)
                .map_err(|e| extraction(format!("failed to write {relative}: {e}")))?;
        }

        debug!(
            dest = %dest.display(),
            files = self.files.len(),
            "Extracted package"
        );
        Ok(())
    }

    /// [`extract_to`](Self::extract_to) on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`PackageArchive::extract_to`].
    pub async fn extract_to_async(self: std::sync::Arc<Self>, dest: PathBuf) -> PluginResult<()> {
        tokio::task::spawn_blocking(move || self.extract_to(&dest))
            .await
            .map_err(|e| extraction(format!("extraction task failed: {e}")))?
    }
}

fn extraction(message: String) -> PluginError {
    PluginError::ExtractionError { message }
}

/// Regular files, directories and metadata headers only.
fn is_safe_entry_type(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::Regular
            | tar::EntryType::Directory
            | tar::EntryType::GNULongName
            | tar::EntryType::XHeader
            | tar::EntryType::XGlobalHeader
    )
}

/// Reject traversal and absolute paths, drop `.` components and return the
/// `/`-joined relative path. `None` for the archive root itself.
fn normalize_entry_path(path: &Path) -> PluginResult<Option<String>> {
    if path.is_absolute() {
        return Err(PluginError::PathTraversal {
            path: path.display().to_string(),
        });
    }

    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    extraction(format!("non-UTF-8 entry path: {}", path.display()))
                })?;
                parts.push(part);
            },
            Component::CurDir => {},
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(PluginError::PathTraversal {
                    path: path.display().to_string(),
                });
            },
        }
    }

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

/// `dir` must already exist.
fn ensure_within(dest: &Path, dir: &Path, entry: &str) -> PluginResult<()> {
    let canonical = dir
        .canonicalize()
        .map_err(|e| extraction(format!("failed to canonicalize {}: {e}", dir.display())))?;
    if canonical.starts_with(dest) {
        Ok(())
    } else {
        Err(PluginError::PathTraversal {
            path: entry.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Writing packages
// ---------------------------------------------------------------------------

/// Write a package: `manifest` as `plugin.json` followed by `files`.
///
/// Entries are written in path order with zeroed timestamps, so the same
/// inputs always produce the same archive.
///
/// # Errors
///
/// Returns an error if the manifest cannot be serialized, a file path is
/// unsafe, or the output cannot be written.
pub fn write_package(
    out: &Path,
    manifest: &PluginManifest,
    files: &BTreeMap<String, Vec<u8>>,
) -> PluginResult<()> {
    let bytes = package_bytes(manifest, files)?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out, bytes)?;
    Ok(())
}

/// Build package bytes in memory. See [`write_package`].
///
/// # Errors
///
/// See [`write_package`].
pub fn package_bytes(
    manifest: &PluginManifest,
    files: &BTreeMap<String, Vec<u8>>,
) -> PluginResult<Vec<u8>> {
    let manifest_json = manifest.to_json_pretty()?;
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    append_file(&mut builder, MANIFEST_FILE_NAME, manifest_json.as_bytes())?;
    for (path, data) in files {
        if path == MANIFEST_FILE_NAME {
            continue;
        }
        if normalize_entry_path(Path::new(path))?.is_none() {
            return Err(extraction(format!("invalid package path: {path:?}")));
        }
        append_file(&mut builder, path, data)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> PluginResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(u64::try_from(data.len()).unwrap_or(u64::MAX));
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

/// Collect every regular file under `dir` (recursively, symlinks skipped),
/// keyed by `/`-joined relative path.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be walked, or
/// [`PluginError::ExtractionError`] for non-UTF-8 names.
pub fn collect_directory(dir: &Path) -> PluginResult<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];

    while let Some((current, prefix)) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                extraction(format!("non-UTF-8 file name under {}", current.display()))
            })?;
            let relative = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            };

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push((entry.path(), relative));
            } else if file_type.is_file() {
                files.insert(relative, std::fs::read(entry.path())?);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn gzip(tar_data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(tar_data).unwrap();
        encoder.finish().unwrap()
    }

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for &(path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, data).unwrap();
        }
        gzip(&builder.into_inner().unwrap())
    }

    /// Raw single-entry tarball that bypasses the tar crate's path checks.
    fn raw_tarball(path: &[u8], typeflag: u8, link: &[u8], claimed: u64, data: &[u8]) -> Vec<u8> {
        let mut header = [0u8; 512];
        header[..path.len()].copy_from_slice(path);
        header[100..108].copy_from_slice(b"0000644\0");
        header[124..136].copy_from_slice(format!("{claimed:011o}\0").as_bytes());
        header[156] = typeflag;
        header[157..157 + link.len()].copy_from_slice(link);
        header[148..156].copy_from_slice(b"        ");
        let cksum: u32 = header.iter().map(|&b| u32::from(b)).sum();
        header[148..156].copy_from_slice(format!("{cksum:06o}\0 ").as_bytes());

        let mut tar_data = header.to_vec();
        tar_data.extend_from_slice(data);
        tar_data.extend(std::iter::repeat_n(0u8, (512 - data.len() % 512) % 512));
        tar_data.extend(std::iter::repeat_n(0u8, 1024));
        gzip(&tar_data)
    }

    fn manifest_json() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "com.example.pkg",
            "name": "Pkg",
            "version": "0.1.0",
            "description": "test package",
            "author": {"name": "t"},
            "capabilities": {"intents": ["x"]}
        }))
        .unwrap()
    }

    #[test]
    fn reads_manifest_and_modules() {
        let manifest = manifest_json();
        let tgz = tarball(&[
            ("plugin.json", manifest.as_slice()),
            ("./modules/a.wasm", b"\0asm"),
            ("b.native", b"{}"),
            ("docs/readme.md", b"hi"),
            ("docs/nested/c.wasm", b"\0asm"),
        ]);

        let pkg = PackageArchive::from_bytes(&tgz).unwrap();
        assert_eq!(pkg.manifest().unwrap().id.as_str(), "com.example.pkg");
        assert_eq!(pkg.module_paths(), vec!["b.native", "modules/a.wasm"]);
        assert!(pkg.contains("docs/readme.md"));
        assert_eq!(pkg.payload_files().count(), 4);
    }

    #[test]
    fn missing_manifest_is_malformed() {
        let pkg = PackageArchive::from_bytes(&tarball(&[("a.wasm", b"x")])).unwrap();
        assert!(matches!(
            pkg.manifest(),
            Err(PluginError::MalformedManifest(_))
        ));
    }

    #[test]
    fn extracts_into_destination() {
        let tgz = tarball(&[("plugin.json", b"{}"), ("modules/a.wasm", b"\0asm")]);
        let pkg = PackageArchive::from_bytes(&tgz).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        pkg.extract_to(tmp.path()).unwrap();
        assert_eq!(
            std::fs::read(tmp.path().join("modules/a.wasm")).unwrap(),
            b"\0asm"
        );
    }

    #[test]
    fn reject_path_traversal() {
        let tgz = raw_tarball(b"modules/../../../etc/passwd", b'0', b"", 9, b"malicious");
        let err = PackageArchive::from_bytes(&tgz).unwrap_err();
        assert!(matches!(err, PluginError::PathTraversal { .. }), "{err}");
    }

    #[test]
    fn reject_absolute_path() {
        let tgz = raw_tarball(b"/etc/passwd", b'0', b"", 9, b"malicious");
        let err = PackageArchive::from_bytes(&tgz).unwrap_err();
        assert!(matches!(err, PluginError::PathTraversal { .. }), "{err}");
    }

    #[test]
    fn reject_symlink_and_hardlink() {
        for typeflag in [b'2', b'1'] {
            let tgz = raw_tarball(b"evil-link", typeflag, b"/etc/passwd", 0, b"");
            let err = PackageArchive::from_bytes(&tgz).unwrap_err();
            assert!(matches!(err, PluginError::UnsafeEntryType { .. }), "{err}");
        }
    }

    #[test]
    fn reject_decompression_bomb() {
        let tgz = raw_tarball(b"bomb.bin", b'0', b"", MAX_EXTRACTED_SIZE + 1, b"small");
        let err = PackageArchive::from_bytes(&tgz).unwrap_err();
        assert!(err.to_string().contains("maximum extracted size"), "{err}");
    }

    #[test]
    fn reject_empty_and_garbage() {
        assert!(PackageArchive::from_bytes(&tarball(&[])).is_err());
        assert!(PackageArchive::from_bytes(b"definitely not gzip").is_err());
    }

    #[test]
    fn reject_duplicate_entries() {
        let tgz = tarball(&[("plugin.json", b"{}"), ("plugin.json", b"{\"evil\":1}")]);
        let err = PackageArchive::from_bytes(&tgz).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn size_ceiling_applies_to_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("big.lpkg");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let err = PackageArchive::read(&path, 1024).unwrap_err();
        assert!(matches!(
            err,
            PluginError::PackageTooLarge {
                size: 2048,
                limit: 1024
            }
        ));
    }

    #[test]
    fn written_packages_read_back_deterministically() {
        let manifest = manifest::parse(&manifest_json()).unwrap();
        let mut files = BTreeMap::new();
        files.insert("modules/a.wasm".to_string(), b"\0asm".to_vec());

        let first = package_bytes(&manifest, &files).unwrap();
        let second = package_bytes(&manifest, &files).unwrap();
        assert_eq!(first, second);

        let pkg = PackageArchive::from_bytes(&first).unwrap();
        assert_eq!(pkg.manifest().unwrap(), manifest);
        assert_eq!(pkg.file("modules/a.wasm"), Some(&b"\0asm"[..]));
    }

    #[test]
    fn collect_directory_walks_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("modules")).unwrap();
        std::fs::write(tmp.path().join("plugin.json"), b"{}").unwrap();
        std::fs::write(tmp.path().join("modules/a.wasm"), b"x").unwrap();

        let files = collect_directory(tmp.path()).unwrap();
        assert_eq!(
            files.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["modules/a.wasm", "plugin.json"]
        );
    }

    #[test]
    fn module_path_rules() {
        assert!(is_module_path("a.wasm"));
        assert!(is_module_path("modules/b.native"));
        assert!(!is_module_path("lib/c.wasm"));
        assert!(!is_module_path("modules/x/d.wasm"));
        assert!(!is_module_path("readme.md"));
        assert!(is_package_path(Path::new("/p/hash.lpkg")));
        assert!(is_package_path(Path::new("hash.tar.gz")));
        assert!(!is_package_path(Path::new("hash.zip")));
    }
}
