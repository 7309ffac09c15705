//! Execution request and response types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One request routed to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRequest {
    /// What kind of work is being asked for, e.g. `analyze_hash`.
    pub intent: String,
    /// Intent-specific parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Case the request belongs to, for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    /// User who issued the request, for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Evidence item the request concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Execution budget. Falls back to the plugin's declared default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PluginRequest {
    /// A request for `intent` with no parameters.
    #[must_use]
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            parameters: BTreeMap::new(),
            case_id: None,
            user_id: None,
            evidence_ref: None,
            tags: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Replace the parameter bag.
    #[must_use]
    pub fn with_params(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Attach a case id.
    #[must_use]
    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    /// Attach a user id.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach an evidence reference.
    #[must_use]
    pub fn with_evidence(mut self, evidence_ref: impl Into<String>) -> Self {
        self.evidence_ref = Some(evidence_ref.into());
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the execution budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The execution budget, if set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// String parameter lookup.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Boolean parameter lookup. Accepts JSON booleans and `"true"`/`"false"`.
    #[must_use]
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        match self.parameters.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// A source backing a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Where the information came from (service, tool, file).
    pub source: String,
    /// Link to the source, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Relevant excerpt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl Citation {
    /// A citation naming `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            url: None,
            excerpt: None,
        }
    }

    /// Attach a URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Attach an excerpt.
    #[must_use]
    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = Some(excerpt.into());
        self
    }
}

/// A follow-up the investigator may want to run next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    /// Intent to route.
    pub intent: String,
    /// Short human-readable label.
    pub label: String,
    /// Parameters to pass along.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl SuggestedAction {
    /// Suggest running `intent`.
    #[must_use]
    pub fn new(intent: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            label: label.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one plugin execution.
///
/// Built with [`success`](Self::success) or [`failure`](Self::failure) plus
/// the `with_*` builders; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResponse {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    suggested_actions: Vec<SuggestedAction>,
}

impl PluginResponse {
    /// A successful response carrying `data`.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            citations: Vec::new(),
            metadata: BTreeMap::new(),
            output_hash: None,
            suggested_actions: Vec::new(),
        }
    }

    /// A failed response with a reason.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            citations: Vec::new(),
            metadata: BTreeMap::new(),
            output_hash: None,
            suggested_actions: Vec::new(),
        }
    }

    /// Add a citation.
    #[must_use]
    pub fn with_citation(mut self, citation: Citation) -> Self {
        self.citations.push(citation);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a suggested follow-up.
    #[must_use]
    pub fn with_suggestion(mut self, action: SuggestedAction) -> Self {
        self.suggested_actions.push(action);
        self
    }

    /// Record the SHA-256 of the serialized output data.
    #[must_use]
    pub fn with_output_hash(mut self) -> Self {
        self.output_hash = Some(Self::hash_data(&self.data));
        self
    }

    /// Whether the plugin succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Output data.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Failure reason, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Citations.
    #[must_use]
    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    /// Metadata bag.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Integrity hash of the output, if recorded.
    #[must_use]
    pub fn output_hash(&self) -> Option<&str> {
        self.output_hash.as_deref()
    }

    /// Suggested follow-ups.
    #[must_use]
    pub fn suggested_actions(&self) -> &[SuggestedAction] {
        &self.suggested_actions
    }

    /// Whether the recorded output hash matches the data. `None` when no
    /// hash was recorded.
    #[must_use]
    pub fn verify_output_hash(&self) -> Option<bool> {
        self.output_hash
            .as_deref()
            .map(|expected| expected == Self::hash_data(&self.data))
    }

    fn hash_data(data: &Value) -> String {
        // serde_json writes object keys in map order; `Value` objects use a
        // sorted map without the `preserve_order` feature, so this is stable.
        let bytes = serde_json::to_vec(data).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }
}
