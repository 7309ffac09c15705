//! Host configuration lookup and the per-plugin read-only view.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::plugin::PluginId;
use crate::sandbox::Liveness;

/// Key/value configuration lookup supplied by the host.
///
/// Keys are fully qualified: `<plugin id>.<key>`.
pub trait ConfigSource: Send + Sync {
    /// Look up a fully qualified key.
    fn get(&self, key: &str) -> Option<Value>;
}

/// In-memory configuration source.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    values: BTreeMap<String, Value>,
}

impl StaticConfigSource {
    /// An empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fully qualified key.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for StaticConfigSource {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

/// Resolves keys against the `[settings.<plugin-id>]` tables.
///
/// Plugin ids contain dots, so the longest id that prefixes the key wins.
/// The remainder may address nested tables (`scan.depth`).
impl ConfigSource for lantern_config::Config {
    fn get(&self, key: &str) -> Option<Value> {
        let (table, rest) = self
            .settings
            .iter()
            .filter_map(|(id, table)| {
                key.strip_prefix(id.as_str())
                    .and_then(|r| r.strip_prefix('.'))
                    .map(|rest| (id.len(), table, rest))
            })
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, table, rest)| (table, rest))?;

        let mut parts = rest.split('.');
        let mut current = table.get(parts.next()?)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        serde_json::to_value(current).ok()
    }
}

/// Read-only configuration scoped to one plugin.
#[derive(Clone)]
pub struct ConfigView {
    plugin_id: PluginId,
    source: Arc<dyn ConfigSource>,
    liveness: Liveness,
}

impl ConfigView {
    pub(crate) fn new(
        plugin_id: PluginId,
        source: Arc<dyn ConfigSource>,
        liveness: Liveness,
    ) -> Self {
        Self {
            plugin_id,
            source,
            liveness,
        }
    }

    /// Look up `key` for this plugin. Always `None` once the owning context
    /// is disposed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        if self.liveness.is_revoked() {
            return None;
        }
        self.source.get(&format!("{}.{key}", self.plugin_id))
    }

    /// String lookup.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean lookup.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    /// Unsigned integer lookup.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.as_u64()
    }
}

impl fmt::Debug for ConfigView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigView")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}
