//! `LANTERN_*` environment overrides.
//!
//! The loader takes the environment as a plain map so callers (and tests)
//! decide what is visible. [`collect_env_vars`] snapshots the process
//! environment for production use.

use std::collections::HashMap;

use tracing::warn;

/// Environment variable → dotted config path.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("LANTERN_LOG_LEVEL", "logging.level"),
    ("LANTERN_LOG_FORMAT", "logging.format"),
    ("LANTERN_PLUGIN_DIR", "plugins.directory"),
    ("LANTERN_WORK_DIR", "plugins.work_dir"),
    ("LANTERN_EVIDENCE_DIR", "evidence.root"),
    ("LANTERN_REQUIRE_SIGNATURES", "plugins.require_signatures"),
];

/// Snapshot all `LANTERN_*` variables from the process environment.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("LANTERN_"))
        .collect()
}

/// Apply known overrides from `env` onto `merged`. Returns how many applied.
pub fn apply_env_overrides(
    merged: &mut toml::Value,
    env: &HashMap<String, String>,
) -> usize {
    let mut applied = 0usize;
    for (var, path) in ENV_OVERRIDES {
        let Some(raw) = env.get(*var) else {
            continue;
        };
        let value = if path.ends_with("require_signatures") {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => toml::Value::Boolean(true),
                "0" | "false" | "no" | "off" => toml::Value::Boolean(false),
                _ => {
                    warn!(var, value = %raw, "Ignoring non-boolean environment override");
                    continue;
                },
            }
        } else {
            toml::Value::String(raw.clone())
        };

        if set_path(merged, path, value) {
            applied = applied.saturating_add(1);
        }
    }
    applied
}

/// Set a dotted `path` in a table tree, creating intermediate tables.
fn set_path(root: &mut toml::Value, path: &str, value: toml::Value) -> bool {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return false;
    };

    let mut cursor = root;
    for segment in segments {
        let Some(table) = cursor.as_table_mut() else {
            return false;
        };
        cursor = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }

    match cursor.as_table_mut() {
        Some(table) => {
            table.insert(leaf.to_owned(), value);
            true
        },
        None => false,
    }
}
