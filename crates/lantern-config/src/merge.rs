//! Deep merge of TOML value trees.
//!
//! The merge operates on raw [`toml::Value`] trees rather than deserialized
//! structs, so a key absent from an overlay never overrides the base layer.

/// Which configuration layer a file belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConfigLayer {
    /// System-wide configuration (`/etc/lantern/config.toml`).
    System,
    /// User-level configuration (`~/.lantern/config.toml`).
    User,
    /// Workspace-level configuration (`{workspace}/.lantern/config.toml`).
    Workspace,
    /// A file named explicitly on the command line.
    Explicit,
}

impl std::fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Workspace => write!(f, "workspace"),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

/// Deep-merge `overlay` into `base`.
///
/// Tables merge per key. Scalars and arrays from the overlay replace the base
/// value.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                match base_table.get_mut(key) {
                    Some(base_val) if base_val.is_table() && overlay_val.is_table() => {
                        deep_merge(base_val, overlay_val);
                    },
                    Some(base_val) => *base_val = overlay_val.clone(),
                    None => {
                        base_table.insert(key.clone(), overlay_val.clone());
                    },
                }
            }
        },
        (base, overlay) => *base = overlay.clone(),
    }
}
