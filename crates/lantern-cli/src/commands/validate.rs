//! `validate`: run the admission checks without loading anything.

use std::path::Path;

use lantern_config::Config;
use lantern_plugins::{PluginValidator, ValidationPolicy};

use crate::theme::Theme;

pub(crate) async fn run(config: &Config, package: &Path) -> anyhow::Result<()> {
    let validator = PluginValidator::new(ValidationPolicy::from_config(&config.plugins));
    let result = validator.validate(package).await;

    println!("{}", Theme::header(&format!("Validating {}", package.display())));
    if let Some(manifest) = &result.manifest {
        println!("{}", Theme::kv("Plugin", manifest.id.as_str()));
        println!("{}", Theme::kv("Version", &manifest.version.to_string()));
    }
    for warning in &result.warnings {
        println!("{}", Theme::warning(warning));
    }
    for error in &result.errors {
        println!("{}", Theme::error(error));
    }

    if result.is_valid() {
        println!("{}", Theme::success("Package is valid"));
        Ok(())
    } else {
        anyhow::bail!("{} validation error(s)", result.errors.len())
    }
}
