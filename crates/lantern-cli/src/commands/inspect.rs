//! `inspect`: print a package's manifest.

use std::path::Path;

use anyhow::Context;
use lantern_config::Config;
use lantern_plugins::PackageArchive;

use crate::theme::Theme;

pub(crate) fn run(config: &Config, package: &Path, files: bool) -> anyhow::Result<()> {
    let archive = PackageArchive::read(package, config.plugins.max_package_bytes)
        .with_context(|| format!("failed to read {}", package.display()))?;
    let manifest = archive.manifest().context("package manifest is invalid")?;
    println!("{}", manifest.to_json_pretty()?);

    if files {
        println!("\n{}", Theme::header("Files"));
        println!("{}", Theme::separator());
        for (path, data) in archive.payload_files() {
            println!("  {path:<48} {:>10}", data.len());
        }
        println!(
            "\n{}",
            Theme::dimmed(&format!("{} bytes compressed", archive.compressed_size()))
        );
    }
    Ok(())
}
