//! Static package checks run before any plugin code is loaded.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PluginError;
use crate::manifest::PluginManifest;
use crate::package::{PackageArchive, is_module_path};
use crate::signature;

/// Permissions that are never granted, whatever the deployment allows.
pub const DENIED_PERMISSIONS: &[&str] = &["system.admin", "kernel.access", "security.bypass"];

/// Permission tokens the sandbox knows how to broker.
pub const KNOWN_PERMISSIONS: &[&str] = &[
    "filesystem.read",
    "filesystem.write",
    "network.api",
    "evidence.read",
    "evidence.write",
    "tools.forensics",
    "tools.network",
];

/// Version of this runtime, checked against manifest `hostVersion`.
#[must_use]
pub fn host_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

/// Admission policy.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Largest package file accepted.
    pub max_package_bytes: u64,
    /// Reject unsigned packages.
    pub require_signatures: bool,
    /// Base64 public keys whose signatures are trusted.
    pub trusted_keys: Vec<String>,
    /// Version compared against `hostVersion`.
    pub host_version: semver::Version,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::from_config(&lantern_config::PluginsSection::default())
    }
}

impl ValidationPolicy {
    /// Policy from the `[plugins]` config section.
    #[must_use]
    pub fn from_config(section: &lantern_config::PluginsSection) -> Self {
        Self {
            max_package_bytes: section.max_package_bytes,
            require_signatures: section.require_signatures,
            trusted_keys: section.trusted_keys.clone(),
            host_version: host_version(),
        }
    }

    /// Require every package to be signed.
    #[must_use]
    pub fn requiring_signatures(mut self) -> Self {
        self.require_signatures = true;
        self
    }

    /// Trust a base64 public key.
    #[must_use]
    pub fn with_trusted_key(mut self, key: impl Into<String>) -> Self {
        self.trusted_keys.push(key.into());
        self
    }

    /// Override the host version (tests, embedding hosts).
    #[must_use]
    pub fn with_host_version(mut self, version: semver::Version) -> Self {
        self.host_version = version;
        self
    }
}

/// Outcome of validating one package.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Blocking findings, in check order.
    pub errors: Vec<String>,
    /// Advisory findings.
    pub warnings: Vec<String>,
    /// The manifest, when it parsed.
    pub manifest: Option<PluginManifest>,
    archive: Option<Arc<PackageArchive>>,
}

impl ValidationResult {
    /// No blocking findings.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The archive that was inspected, when it could be read.
    #[must_use]
    pub fn archive(&self) -> Option<&Arc<PackageArchive>> {
        self.archive.as_ref()
    }

    /// The rejection as an error, or `None` if the package is valid.
    #[must_use]
    pub fn to_error(&self) -> Option<PluginError> {
        if self.is_valid() {
            return None;
        }
        // A manifest that never parsed is its own category.
        if self.manifest.is_none() && self.archive.is_some() {
            return Some(PluginError::MalformedManifest(self.errors.join("; ")));
        }
        Some(PluginError::PolicyRejected {
            errors: self.errors.clone(),
        })
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Applies integrity and policy checks to packages. Never runs plugin code.
#[derive(Debug, Clone, Default)]
pub struct PluginValidator {
    policy: ValidationPolicy,
}

impl PluginValidator {
    /// Validator with the given policy.
    #[must_use]
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// The policy in force.
    #[must_use]
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate a package file.
    pub async fn validate(&self, path: &Path) -> ValidationResult {
        match self.open(path).await {
            Ok(archive) => {
                let result = self.validate_archive(archive);
                debug!(
                    package = %path.display(),
                    errors = result.errors.len(),
                    warnings = result.warnings.len(),
                    "Validated package"
                );
                result
            },
            Err(result) => result,
        }
    }

    /// Read a package under the size ceiling. An unreadable package comes
    /// back as a failed [`ValidationResult`].
    ///
    /// # Errors
    ///
    /// The failed result when the file is missing, too large or not a
    /// well-formed archive.
    pub async fn open(&self, path: &Path) -> Result<PackageArchive, ValidationResult> {
        PackageArchive::open(path, self.policy.max_package_bytes)
            .await
            .map_err(|e| {
                warn!(package = %path.display(), error = %e, "Package is not a readable archive");
                ValidationResult {
                    errors: vec![format!("package is not a well-formed archive: {e}")],
                    ..ValidationResult::default()
                }
            })
    }

    /// Validate an archive already read into memory.
    #[must_use]
    pub fn validate_archive(&self, archive: PackageArchive) -> ValidationResult {
        let archive = Arc::new(archive);
        let mut result = ValidationResult {
            archive: Some(Arc::clone(&archive)),
            ..ValidationResult::default()
        };

        let manifest = match archive.manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                result.error(e.to_string());
                return result;
            },
        };

        if manifest.intents().is_empty() {
            result.error("manifest declares no intents");
        }

        let modules = archive.module_paths();
        if modules.is_empty() {
            result.error("package contains no executable module (.wasm or .native)");
        }

        for denied in DENIED_PERMISSIONS {
            if manifest.requests(denied) {
                result.error(format!("permission '{denied}' is not allowed"));
            }
        }

        for permission in &manifest.permissions {
            if !KNOWN_PERMISSIONS.contains(&permission.as_str())
                && !DENIED_PERMISSIONS.contains(&permission.as_str())
            {
                result.warning(format!(
                    "unknown permission '{permission}' will not be granted"
                ));
            }
        }

        Self::check_entry_point(&manifest, &archive, &mut result);
        self.check_host_version(&manifest, &mut result);
        self.check_signature(&manifest, &archive, &mut result);

        if manifest.requests("network.api") && !manifest.capabilities.requires_internet {
            result.warning("requests network.api but does not declare requiresInternet");
        }
        if manifest.capabilities.requires_internet && !manifest.requests("network.api") {
            result.warning("declares requiresInternet without requesting network.api; all outbound requests will be denied");
        }
        if manifest.capabilities.requires_gpu {
            result.warning("requiresGpu is declared but accelerators are not brokered");
        }

        result.manifest = Some(manifest);
        result
    }

    fn check_entry_point(
        manifest: &PluginManifest,
        archive: &PackageArchive,
        result: &mut ValidationResult,
    ) {
        let Some(entry) = &manifest.entry_point else {
            return;
        };
        let module = entry.module.trim_start_matches("./");
        let Some(bytes) = archive.file(module) else {
            result.error(format!("entry point module '{}' not found in package", entry.module));
            return;
        };
        if !is_module_path(module) {
            result.error(format!(
                "entry point module '{}' must be a .wasm or .native file at the package root or under modules/",
                entry.module
            ));
        }
        if let Some(expected) = &entry.hash {
            let actual = blake3::hash(bytes).to_hex().to_string();
            if !actual.eq_ignore_ascii_case(expected) {
                result.error(
                    PluginError::HashMismatch {
                        expected: expected.clone(),
                        actual,
                    }
                    .to_string(),
                );
            }
        }
    }

    fn check_host_version(&self, manifest: &PluginManifest, result: &mut ValidationResult) {
        if let Some(req) = &manifest.host_version
            && !req.matches(&self.policy.host_version)
        {
            result.error(format!(
                "requires host version {req}, running {}",
                self.policy.host_version
            ));
        }
    }

    fn check_signature(
        &self,
        manifest: &PluginManifest,
        archive: &PackageArchive,
        result: &mut ValidationResult,
    ) {
        let Some(block) = &manifest.signature else {
            if self.policy.require_signatures {
                result.error("package is unsigned and signatures are required");
            } else {
                result.warning("package is unsigned");
            }
            return;
        };

        let verified = signature::package_digest(manifest, archive.payload_files())
            .and_then(|digest| signature::verify(block, &digest));
        match verified {
            Ok(key) => {
                let encoded = signature::public_key_base64(&key);
                if !self
                    .policy
                    .trusted_keys
                    .iter()
                    .any(|trusted| trusted.trim() == encoded)
                {
                    result.warning(format!("package is signed by an untrusted key ({encoded})"));
                }
            },
            Err(e) => result.error(e.to_string()),
        }
    }
}
