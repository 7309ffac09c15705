//! Package and manifest fixtures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use lantern_plugins::package::write_package;
use lantern_plugins::{PluginManifest, PluginResult, manifest, signature};
use serde_json::{Value, json};

/// Create a manifest with the given id and intents and no permissions.
///
/// # Panics
///
/// If `id` is not a valid plugin id.
#[must_use]
pub fn test_manifest(id: &str, intents: &[&str]) -> PluginManifest {
    PackageBuilder::new(id).intents(intents.iter().copied()).manifest()
}

/// Builds plugin packages for tests.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    manifest: Value,
    files: BTreeMap<String, Vec<u8>>,
    signing_key: Option<SigningKey>,
}

impl PackageBuilder {
    /// A package for `id`, version 1.0.0, with no modules.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            manifest: json!({
                "id": id,
                "name": id,
                "version": "1.0.0",
                "description": "test plugin",
                "author": { "name": "Lantern Tests" },
                "permissions": [],
                "capabilities": { "intents": [] },
            }),
            files: BTreeMap::new(),
            signing_key: None,
        }
    }

    /// Set the version.
    #[must_use]
    pub fn version(mut self, version: &str) -> Self {
        self.manifest["version"] = json!(version);
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.manifest["name"] = json!(name);
        self
    }

    /// Set the category.
    #[must_use]
    pub fn category(mut self, category: &str) -> Self {
        self.manifest["category"] = json!(category);
        self
    }

    /// Declare an intent.
    #[must_use]
    pub fn intent(mut self, intent: &str) -> Self {
        push(&mut self.manifest["capabilities"]["intents"], intent);
        self
    }

    /// Declare several intents.
    #[must_use]
    pub fn intents<'a>(mut self, intents: impl IntoIterator<Item = &'a str>) -> Self {
        for intent in intents {
            self = self.intent(intent);
        }
        self
    }

    /// Request a permission.
    #[must_use]
    pub fn permission(mut self, permission: &str) -> Self {
        push(&mut self.manifest["permissions"], permission);
        self
    }

    /// Declare `requiresInternet`.
    #[must_use]
    pub fn requires_internet(mut self) -> Self {
        self.manifest["capabilities"]["requiresInternet"] = json!(true);
        self
    }

    /// Set the entry point.
    #[must_use]
    pub fn entry_point(mut self, module: &str, symbol: Option<&str>) -> Self {
        let mut entry = json!({ "module": module });
        if let Some(symbol) = symbol {
            entry["symbol"] = json!(symbol);
        }
        self.manifest["entryPoint"] = entry;
        self
    }

    /// Set an arbitrary manifest key.
    #[must_use]
    pub fn manifest_value(mut self, key: &str, value: Value) -> Self {
        self.manifest[key] = value;
        self
    }

    /// Add `plugin.native` naming `symbol` in the native registry.
    #[must_use]
    pub fn native(self, symbol: &str) -> Self {
        self.native_at("plugin.native", symbol)
    }

    /// Add a native descriptor at `path`.
    #[must_use]
    pub fn native_at(self, path: &str, symbol: &str) -> Self {
        let descriptor = json!({ "symbol": symbol }).to_string().into_bytes();
        self.file(path, descriptor)
    }

    /// Add a WASM module at `modules/<name>`.
    #[must_use]
    pub fn wasm(self, name: &str, bytes: Vec<u8>) -> Self {
        self.file(&format!("modules/{name}"), bytes)
    }

    /// Add any file.
    #[must_use]
    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_string(), data.into());
        self
    }

    /// Sign the package with `key` when it is written.
    #[must_use]
    pub fn signed_with(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// The manifest as JSON.
    #[must_use]
    pub fn manifest_json(&self) -> &Value {
        &self.manifest
    }

    /// The parsed manifest.
    ///
    /// # Panics
    ///
    /// If the fixture produced an invalid manifest.
    #[must_use]
    pub fn manifest(&self) -> PluginManifest {
        match self.try_manifest() {
            Ok(manifest) => manifest,
            Err(e) => panic!("test manifest does not parse: {e}"),
        }
    }

    fn try_manifest(&self) -> PluginResult<PluginManifest> {
        manifest::parse(self.manifest.to_string().as_bytes())
    }

    /// Write the package to `<dir>/<id>.lpkg` and return its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is invalid or the file cannot be
    /// written.
    pub fn write_to(&self, dir: &Path) -> PluginResult<PathBuf> {
        let mut manifest = self.try_manifest()?;
        if let Some(key) = &self.signing_key {
            signature::sign_manifest(&mut manifest, &self.files, key)?;
        }
        let path = dir.join(format!("{}.lpkg", manifest.id));
        write_package(&path, &manifest, &self.files)?;
        Ok(path)
    }
}

fn push(array: &mut Value, item: &str) {
    if let Some(items) = array.as_array_mut() {
        items.push(json!(item));
    } else {
        *array = json!([item]);
    }
}
