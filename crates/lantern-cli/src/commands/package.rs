//! `package`: pack a plugin directory into a distributable archive.

use std::path::{Path, PathBuf};

use anyhow::Context;
use lantern_plugins::manifest::{self, MANIFEST_FILE_NAME};
use lantern_plugins::package::{collect_directory, is_module_path, write_package};
use lantern_plugins::signature::{public_key_base64, sign_manifest, signing_key_from_base64};

use crate::theme::Theme;

pub(crate) fn run(dir: &Path, output: Option<&Path>, sign_key: Option<&Path>) -> anyhow::Result<()> {
    let files = collect_directory(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?;
    let manifest_bytes = files
        .get(MANIFEST_FILE_NAME)
        .with_context(|| format!("{} has no {MANIFEST_FILE_NAME}", dir.display()))?;
    let mut manifest = manifest::parse(manifest_bytes)
        .with_context(|| format!("invalid {MANIFEST_FILE_NAME}"))?;

    if !files.keys().any(|path| is_module_path(path)) {
        println!(
            "{}",
            Theme::warning("no .wasm or .native module found; the package will not load")
        );
    }

    if let Some(key_path) = sign_key {
        let seed = std::fs::read_to_string(key_path)
            .with_context(|| format!("failed to read {}", key_path.display()))?;
        let key = signing_key_from_base64(&seed)?;
        sign_manifest(&mut manifest, &files, &key)?;
        println!(
            "{}",
            Theme::info(&format!(
                "Signed with {}",
                public_key_base64(&key.verifying_key())
            ))
        );
    }

    let out = output.map_or_else(
        || PathBuf::from(format!("{}-{}.lpkg", manifest.id, manifest.version)),
        Path::to_path_buf,
    );
    write_package(&out, &manifest, &files)
        .with_context(|| format!("failed to write {}", out.display()))?;

    println!(
        "{}",
        Theme::success(&format!(
            "Packaged {} {} ({} files) -> {}",
            manifest.id,
            manifest.version,
            files.len(),
            out.display()
        ))
    );
    Ok(())
}
