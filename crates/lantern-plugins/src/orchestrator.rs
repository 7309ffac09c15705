//! Intent orchestrator.
//!
//! Turns a query into an intent, fans it out to every loaded plugin routed
//! for that intent and collects every outcome. One plugin failing never
//! aborts its siblings; partial success is a normal result.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use lantern_telemetry::RequestContext;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};
use uuid::Uuid;

use crate::error::{PluginError, PluginResult};
use crate::manager::{PluginHandle, PluginManager};
use crate::plugin::PluginId;
use crate::request::{PluginRequest, PluginResponse};

/// Fallback per-plugin budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// An intent and its parameters, read out of a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedIntent {
    /// Intent name.
    pub intent: String,
    /// Parameters for the plugins.
    pub parameters: BTreeMap<String, Value>,
}

impl ExtractedIntent {
    /// An intent with no parameters.
    #[must_use]
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
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

/// Reads an intent out of a free-form query.
#[async_trait]
pub trait IntentExtractor: Send + Sync {
    /// Extract the intent.
    ///
    /// # Errors
    ///
    /// [`PluginError::IntentExtraction`] if the query names no intent.
    async fn extract(&self, query: &str) -> PluginResult<ExtractedIntent>;
}

/// Parses structured queries.
///
/// Two forms are accepted:
///
/// - `analyze_hash hash=d41d8cd98f00b204e9800998ecf8427e lookup=true`: the
///   first word is the intent, `key=value` words are parameters (values that
///   parse as JSON keep their type) and any other words are joined into a
///   `query` parameter
/// - `{"intent": "analyze_hash", "parameters": {"hash": "..."}}`
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredQueryExtractor;

#[derive(serde::Deserialize)]
struct JsonQuery {
    intent: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
}

impl StructuredQueryExtractor {
    fn parse(query: &str) -> PluginResult<ExtractedIntent> {
        let query = query.trim();
        if query.starts_with('{') {
            let parsed: JsonQuery = serde_json::from_str(query)
                .map_err(|e| PluginError::IntentExtraction(format!("invalid JSON query: {e}")))?;
            if parsed.intent.trim().is_empty() {
                return Err(PluginError::IntentExtraction("intent is empty".into()));
            }
            return Ok(ExtractedIntent {
                intent: parsed.intent,
                parameters: parsed.parameters,
            });
        }

        let mut words = query.split_whitespace();
        let intent = words
            .next()
            .ok_or_else(|| PluginError::IntentExtraction("query is empty".into()))?;
        if intent.contains('=') {
            return Err(PluginError::IntentExtraction(format!(
                "query must start with an intent, got '{intent}'"
            )));
        }

        let mut extracted = ExtractedIntent::new(intent);
        let mut free_text = Vec::new();
        for word in words {
            match word.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    let value = serde_json::from_str::<Value>(value)
                        .unwrap_or_else(|_| Value::String(value.to_string()));
                    extracted.parameters.insert(key.to_string(), value);
                },
                _ => free_text.push(word),
            }
        }
        if !free_text.is_empty() {
            extracted
                .parameters
                .insert("query".into(), Value::String(free_text.join(" ")));
        }
        Ok(extracted)
    }
}

#[async_trait]
impl IntentExtractor for StructuredQueryExtractor {
    async fn extract(&self, query: &str) -> PluginResult<ExtractedIntent> {
        Self::parse(query)
    }
}

/// Always yields the same intent; the query goes in the `query` parameter.
#[derive(Debug, Clone)]
pub struct FixedIntentExtractor {
    intent: ExtractedIntent,
}

impl FixedIntentExtractor {
    /// Extractor yielding `intent`.
    #[must_use]
    pub fn new(intent: ExtractedIntent) -> Self {
        Self { intent }
    }
}

#[async_trait]
impl IntentExtractor for FixedIntentExtractor {
    async fn extract(&self, query: &str) -> PluginResult<ExtractedIntent> {
        let mut intent = self.intent.clone();
        intent
            .parameters
            .entry("query".into())
            .or_insert_with(|| Value::String(query.to_string()));
        Ok(intent)
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Combines the invocations of one route into a single answer.
#[async_trait]
pub trait ResultSynthesizer: Send + Sync {
    /// Produce the combined answer, or `None` if there is nothing to say.
    async fn synthesize(&self, intent: &str, invocations: &[PluginInvocation]) -> Option<String>;
}

/// Plain-text roll-up: counts plus one line per plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummarySynthesizer;

#[async_trait]
impl ResultSynthesizer for SummarySynthesizer {
    async fn synthesize(&self, intent: &str, invocations: &[PluginInvocation]) -> Option<String> {
        if invocations.is_empty() {
            return None;
        }
        let succeeded = invocations.iter().filter(|i| i.response.is_success()).count();
        let mut lines = vec![format!(
            "{succeeded} of {} plugins succeeded for '{intent}'",
            invocations.len()
        )];
        for invocation in invocations {
            let line = match invocation.response.error() {
                None => format!("- {}: ok", invocation.plugin_name),
                Some(error) => format!("- {}: failed ({error})", invocation.plugin_name),
            };
            lines.push(line);
        }
        Some(lines.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One plugin's part in a route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInvocation {
    /// Plugin that ran.
    pub plugin_id: PluginId,
    /// Its display name.
    pub plugin_name: String,
    /// What it returned; failures included.
    pub response: PluginResponse,
    /// Wall-clock time.
    #[serde(rename = "elapsedMs", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Everything one route produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorResult {
    /// Correlation id of the route.
    pub correlation_id: Uuid,
    /// Intent routed.
    pub intent: String,
    /// Parameters passed to every plugin.
    pub parameters: BTreeMap<String, Value>,
    /// One entry per matched plugin, in completion-independent order.
    pub invocations: Vec<PluginInvocation>,
    /// Combined answer, when a synthesizer is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
}

impl OrchestratorResult {
    /// Invocations that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.invocations
            .iter()
            .filter(|i| i.response.is_success())
            .count()
    }

    /// Invocations that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.invocations.len().saturating_sub(self.succeeded())
    }

    /// Whether any plugin handled the intent at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Query context
// ---------------------------------------------------------------------------

/// Caller-side settings for one route.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Correlation context; every invocation logs under its span.
    pub request: RequestContext,
    /// Per-plugin budget overriding plugin and host defaults.
    pub timeout: Option<Duration>,
    /// Cancelling this cancels every invocation.
    pub cancel: CancellationToken,
    /// Case the query belongs to.
    pub case_id: Option<String>,
    /// User issuing the query.
    pub user_id: Option<String>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self {
            request: RequestContext::new("orchestrator").with_operation("route"),
            timeout: None,
            cancel: CancellationToken::new(),
            case_id: None,
            user_id: None,
        }
    }
}

impl QueryContext {
    /// Fresh context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-plugin budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach a case.
    #[must_use]
    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    /// Attach a user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Continue an existing correlation.
    #[must_use]
    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = request;
        self
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Routes queries to plugins.
pub struct IntentOrchestrator {
    manager: Arc<PluginManager>,
    extractor: Arc<dyn IntentExtractor>,
    synthesizer: Option<Arc<dyn ResultSynthesizer>>,
    default_timeout: Duration,
}

impl IntentOrchestrator {
    /// Orchestrator over `manager` using the structured-query extractor and
    /// no synthesis.
    #[must_use]
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self {
            manager,
            extractor: Arc::new(StructuredQueryExtractor),
            synthesizer: None,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Apply the `[orchestrator]` section.
    #[must_use]
    pub fn with_config(mut self, section: &lantern_config::OrchestratorSection) -> Self {
        self.default_timeout = Duration::from_secs(section.default_timeout_secs);
        self
    }

    /// Replace the intent extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn IntentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Enable synthesis.
    #[must_use]
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn ResultSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Set the fallback per-plugin budget.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The manager plugins are resolved through.
    #[must_use]
    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Extract an intent from `query` and dispatch it.
    ///
    /// # Errors
    ///
    /// Only extraction failures. Plugin failures are reported per
    /// invocation inside the result.
    pub async fn route(&self, query: &str, ctx: QueryContext) -> PluginResult<OrchestratorResult> {
        let span = ctx.request.span();
        let extracted = self.extractor.extract(query).instrument(span).await?;
        let mut request = PluginRequest::new(extracted.intent).with_params(extracted.parameters);
        if let Some(case_id) = &ctx.case_id {
            request = request.with_case(case_id.clone());
        }
        if let Some(user_id) = &ctx.user_id {
            request = request.with_user(user_id.clone());
        }
        Ok(self.dispatch(request, ctx).await)
    }

    /// Send `request` to every plugin routed for its intent and collect the
    /// outcomes. An intent no plugin handles yields an empty result.
    pub async fn dispatch(&self, request: PluginRequest, ctx: QueryContext) -> OrchestratorResult {
        let span = ctx.request.span();
        let correlation_id = ctx.request.correlation_id;
        async move {
            let candidates = self.manager.get_by_intent(&request.intent).await;
            debug!(
                intent = %request.intent,
                candidates = candidates.len(),
                "Resolved intent"
            );

            let invocations = join_all(
                candidates
                    .iter()
                    .map(|handle| self.invoke(handle, request.clone(), &ctx)),
            )
            .await;

            let synthesis = match &self.synthesizer {
                Some(s) => s.synthesize(&request.intent, &invocations).await,
                None => None,
            };

            let result = OrchestratorResult {
                correlation_id,
                intent: request.intent,
                parameters: request.parameters,
                invocations,
                synthesis,
            };
            info!(
                intent = %result.intent,
                plugins = result.invocations.len(),
                succeeded = result.succeeded(),
                failed = result.failed(),
                "Routed intent"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn invoke(
        &self,
        handle: &PluginHandle,
        request: PluginRequest,
        ctx: &QueryContext,
    ) -> PluginInvocation {
        let budget = ctx
            .timeout
            .or_else(|| request.timeout())
            .or_else(|| handle.capabilities().default_timeout())
            .unwrap_or(self.default_timeout);
        let request = request.with_timeout(budget);
        let started = Instant::now();

        let response = match handle.execute(request, ctx.cancel.child_token()).await {
            Ok(response) => response,
            Err(e) => PluginResponse::failure(e.to_string())
                .with_metadata("errorKind", e.kind().to_string()),
        };

        PluginInvocation {
            plugin_id: handle.id().clone(),
            plugin_name: handle.manifest().name.clone(),
            response,
            elapsed: started.elapsed(),
        }
    }
}

impl fmt::Debug for IntentOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentOrchestrator")
            .field("default_timeout", &self.default_timeout)
            .field("synthesis", &self.synthesizer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn structured_query_splits_words() {
        let parsed = StructuredQueryExtractor::parse(
            "analyze_hash hash=abc lookup=true depth=2 what is this",
        )
        .unwrap();
        assert_eq!(parsed.intent, "analyze_hash");
        assert_eq!(parsed.parameters["hash"], json!("abc"));
        assert_eq!(parsed.parameters["lookup"], json!(true));
        assert_eq!(parsed.parameters["depth"], json!(2));
        assert_eq!(parsed.parameters["query"], json!("what is this"));
    }

    #[test]
    fn structured_query_accepts_json() {
        let parsed = StructuredQueryExtractor::parse(
            r#"{"intent": "whois", "parameters": {"domain": "example.com"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.intent, "whois");
        assert_eq!(parsed.parameters["domain"], json!("example.com"));
    }

    #[test]
    fn structured_query_rejects_empty_and_headless() {
        assert!(matches!(
            StructuredQueryExtractor::parse("   "),
            Err(PluginError::IntentExtraction(_))
        ));
        assert!(matches!(
            StructuredQueryExtractor::parse("hash=abc"),
            Err(PluginError::IntentExtraction(_))
        ));
        assert!(matches!(
            StructuredQueryExtractor::parse(r#"{"intent": ""}"#),
            Err(PluginError::IntentExtraction(_))
        ));
    }

    #[tokio::test]
    async fn fixed_extractor_keeps_query_text() {
        let extractor = FixedIntentExtractor::new(ExtractedIntent::new("search"));
        let extracted = extractor.extract("who owns 10.0.0.1").await.unwrap();
        assert_eq!(extracted.intent, "search");
        assert_eq!(extracted.parameters["query"], json!("who owns 10.0.0.1"));
    }

    #[tokio::test]
    async fn summary_lists_each_plugin() {
        let invocations = vec![
            PluginInvocation {
                plugin_id: PluginId::from_static("com.test.a"),
                plugin_name: "A".into(),
                response: PluginResponse::success(json!({})),
                elapsed: Duration::from_millis(3),
            },
            PluginInvocation {
                plugin_id: PluginId::from_static("com.test.b"),
                plugin_name: "B".into(),
                response: PluginResponse::failure("offline"),
                elapsed: Duration::from_millis(5),
            },
        ];
        let summary = SummarySynthesizer
            .synthesize("lookup", &invocations)
            .await
            .unwrap();
        assert!(summary.starts_with("1 of 2 plugins succeeded for 'lookup'"));
        assert!(summary.contains("- B: failed (offline)"));
        assert!(SummarySynthesizer.synthesize("lookup", &[]).await.is_none());
    }

    #[test]
    fn invocation_serializes_elapsed_as_millis() {
        let invocation = PluginInvocation {
            plugin_id: PluginId::from_static("com.test.a"),
            plugin_name: "A".into(),
            response: PluginResponse::success(json!(1)),
            elapsed: Duration::from_millis(42),
        };
        let value = serde_json::to_value(&invocation).unwrap();
        assert_eq!(value["elapsedMs"], json!(42));
        assert_eq!(value["pluginId"], json!("com.test.a"));
    }
}
