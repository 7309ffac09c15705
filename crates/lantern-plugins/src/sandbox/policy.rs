//! Allow-list derivation.
//!
//! Pure functions from a plugin's approved permissions (and category) to the
//! concrete resources its brokers will permit. Nothing here touches the
//! filesystem or network.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::validator::DENIED_PERMISSIONS;

/// Permission: read files inside the plugin's roots.
pub const FILESYSTEM_READ: &str = "filesystem.read";
/// Permission: write files inside the plugin's roots.
pub const FILESYSTEM_WRITE: &str = "filesystem.write";
/// Permission: outbound HTTP to category-specific domains.
pub const NETWORK_API: &str = "network.api";
/// Permission: read evidence (store handle and evidence root).
pub const EVIDENCE_READ: &str = "evidence.read";
/// Permission: write evidence.
pub const EVIDENCE_WRITE: &str = "evidence.write";
/// Permission: run forensic utilities.
pub const TOOLS_FORENSICS: &str = "tools.forensics";
/// Permission: run network diagnostic utilities.
pub const TOOLS_NETWORK: &str = "tools.network";

const FORENSICS_DOMAINS: &[&str] = &[
    "www.virustotal.com",
    "hashlookup.circl.lu",
    "mb-api.abuse.ch",
    "otx.alienvault.com",
];

const OSINT_DOMAINS: &[&str] = &[
    "api.shodan.io",
    "crt.sh",
    "haveibeenpwned.com",
    "api.github.com",
];

const THREAT_INTEL_DOMAINS: &[&str] = &[
    "otx.alienvault.com",
    "api.abuseipdb.com",
    "urlhaus-api.abuse.ch",
    "www.virustotal.com",
];

const FORENSIC_TOOLS: &[&str] = &[
    "sha256sum",
    "sha1sum",
    "md5sum",
    "file",
    "strings",
    "exiftool",
    "yara",
];

const NETWORK_TOOLS: &[&str] = &["dig", "whois", "nslookup"];

/// A directory the file accessor may touch, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedRoot {
    /// Root directory. Everything beneath it is covered.
    pub path: PathBuf,
    /// Reads permitted.
    pub read: bool,
    /// Writes permitted.
    pub write: bool,
}

impl AllowedRoot {
    /// A read-only root.
    #[must_use]
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read: true,
            write: false,
        }
    }

    /// A read-write root.
    #[must_use]
    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read: true,
            write: true,
        }
    }
}

/// Requested permissions that policy allows, never including a deny-listed
/// token even if the deployment's allowed list names it.
#[must_use]
pub fn approved_permissions(
    requested: &BTreeSet<String>,
    allowed: &BTreeSet<String>,
) -> BTreeSet<String> {
    requested
        .intersection(allowed)
        .filter(|p| !DENIED_PERMISSIONS.contains(&p.as_str()))
        .cloned()
        .collect()
}

/// File roots for a plugin.
///
/// The working directory and private temp directory carry the
/// `filesystem.*` grants; the evidence root is read-only under
/// `evidence.read`. Roots with no grant are omitted.
#[must_use]
pub fn file_allow_list(
    approved: &BTreeSet<String>,
    working_dir: &Path,
    temp_dir: &Path,
    evidence_root: Option<&Path>,
) -> Vec<AllowedRoot> {
    let read = approved.contains(FILESYSTEM_READ);
    let write = approved.contains(FILESYSTEM_WRITE);
    let mut roots = Vec::new();

    if read || write {
        for path in [working_dir, temp_dir] {
            roots.push(AllowedRoot {
                path: path.to_path_buf(),
                read,
                write,
            });
        }
    }
    if let Some(evidence) = evidence_root
        && approved.contains(EVIDENCE_READ)
    {
        roots.push(AllowedRoot::read_only(evidence));
    }
    roots
}

/// Outbound domains for a plugin. Empty unless `network.api` is approved.
#[must_use]
pub fn domain_allow_list(category: Option<&str>, approved: &BTreeSet<String>) -> BTreeSet<String> {
    if !approved.contains(NETWORK_API) {
        return BTreeSet::new();
    }
    let domains: &[&str] = match category.map(str::to_ascii_lowercase).as_deref() {
        Some("forensics") => FORENSICS_DOMAINS,
        Some("osint") => OSINT_DOMAINS,
        Some("threat-intel" | "threat_intel" | "threatintel") => THREAT_INTEL_DOMAINS,
        _ => &[],
    };
    domains.iter().map(|d| (*d).to_string()).collect()
}

/// Executables a plugin may run, by bare program name.
#[must_use]
pub fn executable_allow_list(approved: &BTreeSet<String>) -> BTreeSet<String> {
    let mut allowed = BTreeSet::new();
    if approved.contains(TOOLS_FORENSICS) {
        allowed.extend(FORENSIC_TOOLS.iter().map(|t| (*t).to_string()));
    }
    if approved.contains(TOOLS_NETWORK) {
        allowed.extend(NETWORK_TOOLS.iter().map(|t| (*t).to_string()));
    }
    allowed
}

/// `host` equals an allowed domain or is a subdomain of one.
#[must_use]
pub fn domain_allowed(host: &str, allowed: &BTreeSet<String>) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed.iter().any(|domain| {
        host == *domain
            || host
                .strip_suffix(domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}
