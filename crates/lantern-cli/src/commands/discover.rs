//! `discover`: list packages in a directory.

use std::path::PathBuf;

use lantern_config::Config;

use crate::settings;
use crate::theme::Theme;

pub(crate) async fn run(config: &Config, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = settings::plugin_dir(config, dir)?;
    let found = lantern_plugins::discovery::discover(&dir, config.plugins.max_package_bytes).await?;

    if found.is_empty() {
        println!("{}", Theme::info(&format!("No packages in {}", dir.display())));
        return Ok(());
    }

    println!("{}", Theme::header(&format!("Packages in {}", dir.display())));
    println!("  {:<36} {:<10} {:<10} FILE", "ID", "VERSION", "STATE");
    println!("{}", Theme::separator());
    for plugin in &found {
        let file = plugin
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!(
            "  {:<36} {:<10} {:<10} {}",
            plugin.id.as_str(),
            plugin.version.to_string(),
            Theme::state(plugin.loaded),
            Theme::dimmed(&file)
        );
    }
    println!("\n{}", Theme::dimmed(&format!("{} package(s)", found.len())));
    Ok(())
}
