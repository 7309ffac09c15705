//! Plugin manifest parsing.
//!
//! Every package carries a `plugin.json` at its root:
//!
//! ```json
//! {
//!   "id": "com.lantern.hash-analyzer",
//!   "name": "Hash Analyzer",
//!   "version": "1.2.0",
//!   "description": "Identifies hash algorithms and verifies file digests",
//!   "author": { "name": "Lantern Team", "email": "team@lantern.dev" },
//!   "category": "forensics",
//!   "permissions": ["filesystem.read", "network.api"],
//!   "capabilities": {
//!     "intents": ["analyze_hash", "check_file_hash"],
//!     "fileTypes": ["bin", "exe"],
//!     "requiresInternet": true,
//!     "requiresGpu": false
//!   },
//!   "entryPoint": { "module": "hash.native" }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// File name of the manifest inside a package.
pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Largest manifest accepted.
const MAX_MANIFEST_BYTES: usize = 256 * 1024;

/// Package author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Display name.
    pub name: String,
    /// Contact address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Publishing organization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

/// Capabilities declared in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestCapabilities {
    /// Intents the plugin claims to service.
    pub intents: BTreeSet<String>,
    /// File types the plugin understands.
    pub file_types: BTreeSet<String>,
    /// Plugin needs outbound network access.
    pub requires_internet: bool,
    /// Plugin wants GPU acceleration.
    pub requires_gpu: bool,
}

/// Detached signature over the package digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBlock {
    /// Signature scheme. Only `ed25519` is accepted.
    pub algorithm: String,
    /// Base64 public key.
    pub public_key: String,
    /// Base64 signature.
    pub signature: String,
}

/// Explicit entry point: which module file, and which exported symbol inside
/// it, implements the plugin contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    /// Module path relative to the package root.
    pub module: String,
    /// Entry symbol. For WASM modules this is the execute export; for
    /// native modules it overrides the descriptor's registration symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Lowercase hex blake3 digest of the module file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// A parsed, immutable plugin manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique reverse-domain identity.
    pub id: PluginId,
    /// Human-readable name.
    pub name: String,
    /// Semantic version.
    pub version: semver::Version,
    /// Short description.
    pub description: String,
    /// Author.
    pub author: Author,
    /// Declared category, e.g. `forensics` or `osint`. Drives the network
    /// allow-list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Free-form tags for catalog display.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Requested permission tokens.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: ManifestCapabilities,
    /// Declared dependency versions (name → requirement).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Optional package signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBlock>,
    /// Optional explicit entry point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
    /// Host versions this plugin is compatible with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_version: Option<semver::VersionReq>,
}

/// Parse a manifest from raw bytes.
///
/// Performs no I/O.
///
/// # Errors
///
/// Returns [`PluginError::MalformedManifest`] if the bytes are not a JSON
/// object with every required field, or a field fails validation.
pub fn parse(bytes: &[u8]) -> PluginResult<PluginManifest> {
    if bytes.len() > MAX_MANIFEST_BYTES {
        return Err(PluginError::MalformedManifest(format!(
            "manifest is {} bytes, exceeding the {MAX_MANIFEST_BYTES} byte limit",
            bytes.len()
        )));
    }

    let manifest: PluginManifest = serde_json::from_slice(bytes)
        .map_err(|e| PluginError::MalformedManifest(e.to_string()))?;
    manifest.check()?;
    Ok(manifest)
}

impl PluginManifest {
    fn check(&self) -> PluginResult<()> {
        require_text("name", &self.name)?;
        require_text("description", &self.description)?;
        require_text("author.name", &self.author.name)?;

        for intent in &self.capabilities.intents {
            require_text("capabilities.intents[]", intent)?;
        }
        for permission in &self.permissions {
            require_text("permissions[]", permission)?;
        }

        if let Some(entry) = &self.entry_point {
            validate_module_path(&entry.module)?;
            if let Some(symbol) = &entry.symbol {
                require_text("entryPoint.symbol", symbol)?;
            }
            if let Some(hash) = &entry.hash
                && (hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()))
            {
                return Err(PluginError::MalformedManifest(
                    "entryPoint.hash must be a 64-character hex blake3 digest".into(),
                ));
            }
        }
        Ok(())
    }

    /// Declared intents.
    #[must_use]
    pub fn intents(&self) -> &BTreeSet<String> {
        &self.capabilities.intents
    }

    /// Whether the manifest declares `intent` (case-sensitive).
    #[must_use]
    pub fn supports_intent(&self, intent: &str) -> bool {
        self.capabilities.intents.contains(intent)
    }

    /// Whether the manifest requests `permission` (case-sensitive).
    #[must_use]
    pub fn requests(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Serialize back to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedManifest`] if serialization fails.
    pub fn to_json_pretty(&self) -> PluginResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| PluginError::MalformedManifest(e.to_string()))
    }
}

fn require_text(field: &str, value: &str) -> PluginResult<()> {
    if value.trim().is_empty() {
        return Err(PluginError::MalformedManifest(format!(
            "field `{field}` must not be blank"
        )));
    }
    Ok(())
}

/// Entry-point module paths must stay inside the package.
fn validate_module_path(module: &str) -> PluginResult<()> {
    let path = Path::new(module);
    if module.is_empty()
        || path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(PluginError::MalformedManifest(format!(
            "entryPoint.module must be a relative path inside the package, got: {module}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn minimal() -> Value {
        json!({
            "id": "com.example.hash",
            "name": "Hash",
            "version": "1.0.0",
            "description": "Hashes things",
            "author": {"name": "Examiner"}
        })
    }

    fn parse_value(v: &Value) -> PluginResult<PluginManifest> {
        parse(&serde_json::to_vec(v).unwrap())
    }

    #[test]
    fn minimal_manifest_parses_with_empty_sets() {
        let m = parse_value(&minimal()).unwrap();
        assert_eq!(m.id.as_str(), "com.example.hash");
        assert_eq!(m.version, semver::Version::new(1, 0, 0));
        assert!(m.permissions.is_empty());
        assert!(m.intents().is_empty());
        assert!(m.signature.is_none());
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        for field in ["id", "name", "version", "author", "description"] {
            let mut v = minimal();
            v.as_object_mut().unwrap().remove(field);
            let err = parse_value(&v).unwrap_err();
            assert!(
                matches!(err, PluginError::MalformedManifest(_)),
                "missing {field} gave {err}"
            );
        }
    }

    #[test]
    fn blank_values_are_malformed() {
        let mut v = minimal();
        v["name"] = json!("   ");
        assert!(matches!(
            parse_value(&v),
            Err(PluginError::MalformedManifest(_))
        ));

        let mut v = minimal();
        v["author"] = json!({"name": ""});
        assert!(matches!(
            parse_value(&v),
            Err(PluginError::MalformedManifest(_))
        ));
    }

    #[test]
    fn bad_id_and_version_are_malformed() {
        let mut v = minimal();
        v["id"] = json!("../../etc");
        assert!(matches!(
            parse_value(&v),
            Err(PluginError::MalformedManifest(_))
        ));

        let mut v = minimal();
        v["version"] = json!("one");
        assert!(matches!(
            parse_value(&v),
            Err(PluginError::MalformedManifest(_))
        ));
    }

    #[test]
    fn unparsable_bytes_are_malformed() {
        assert!(matches!(
            parse(b"not json"),
            Err(PluginError::MalformedManifest(_))
        ));
        assert!(matches!(parse(b"[]"), Err(PluginError::MalformedManifest(_))));
    }

    #[test]
    fn permissions_and_intents_dedupe_case_sensitively() {
        let mut v = minimal();
        v["permissions"] = json!(["filesystem.read", "filesystem.read", "Filesystem.Read"]);
        v["capabilities"] = json!({"intents": ["analyze_hash", "analyze_hash", "ANALYZE_HASH"]});
        let m = parse_value(&v).unwrap();
        assert_eq!(m.permissions.len(), 2);
        assert!(m.requests("filesystem.read"));
        assert!(m.requests("Filesystem.Read"));
        assert_eq!(m.intents().len(), 2);
        assert!(m.supports_intent("analyze_hash"));
        assert!(!m.supports_intent("Analyze_Hash"));
    }

    #[test]
    fn optional_sections_parse() {
        let mut v = minimal();
        v["category"] = json!("forensics");
        v["tags"] = json!(["hash", "triage"]);
        v["dependencies"] = json!({"sha2": "0.10"});
        v["signature"] = json!({"algorithm": "ed25519", "publicKey": "AA==", "signature": "AA=="});
        v["entryPoint"] = json!({"module": "modules/hash.wasm", "symbol": "run"});
        v["hostVersion"] = json!(">=0.1, <2");
        v["capabilities"] = json!({
            "intents": ["analyze_hash"],
            "fileTypes": ["bin"],
            "requiresInternet": true,
            "requiresGpu": false
        });

        let m = parse_value(&v).unwrap();
        assert_eq!(m.category.as_deref(), Some("forensics"));
        assert_eq!(m.tags.len(), 2);
        assert_eq!(m.dependencies.get("sha2").map(String::as_str), Some("0.10"));
        assert_eq!(m.signature.unwrap().algorithm, "ed25519");
        assert_eq!(m.entry_point.unwrap().symbol.as_deref(), Some("run"));
        assert!(m.host_version.unwrap().matches(&semver::Version::new(1, 4, 0)));
        assert!(m.capabilities.requires_internet);
    }

    #[test]
    fn entry_point_cannot_escape_package() {
        for module in ["../outside.wasm", "/abs/mod.wasm", "a/../../b.wasm", ""] {
            let mut v = minimal();
            v["entryPoint"] = json!({"module": module});
            assert!(
                matches!(parse_value(&v), Err(PluginError::MalformedManifest(_))),
                "{module}"
            );
        }
    }

    #[test]
    fn entry_point_hash_must_be_hex() {
        let mut v = minimal();
        v["entryPoint"] = json!({"module": "a.wasm", "hash": "xyz"});
        assert!(parse_value(&v).is_err());
    }

    #[test]
    fn roundtrips_through_pretty_json() {
        let mut v = minimal();
        v["permissions"] = json!(["network.api"]);
        let m = parse_value(&v).unwrap();
        let again = parse(m.to_json_pretty().unwrap().as_bytes()).unwrap();
        assert_eq!(m, again);
    }
}
