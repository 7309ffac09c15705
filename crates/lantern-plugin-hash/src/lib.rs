//! Hash analysis plugin.
//!
//! Linked into the host and registered under [`SYMBOL`]; a package selects
//! it with a `*.native` descriptor naming that symbol. Two intents:
//!
//! - `analyze_hash`: identify the algorithm of a hex digest by its length,
//!   optionally looking it up in the CIRCL hashlookup service when the
//!   plugin was granted `network.api`
//! - `check_file_hash`: compute a SHA-2 digest of a file the sandbox lets the
//!   plugin read, optionally comparing it with an expected value

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod algorithm;

use std::sync::Arc;

use async_trait::async_trait;
use lantern_plugins::sandbox::HttpRequest;
use lantern_plugins::sandbox::policy::NETWORK_API;
use lantern_plugins::{
    Capabilities, Citation, ExecutionContext, NativeModuleRegistry, Plugin, PluginError,
    PluginRequest, PluginResponse, PluginResult, SuggestedAction,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use algorithm::HashAlgorithm;

/// Native registry symbol.
pub const SYMBOL: &str = "lantern.hash-analyzer";
/// Identify a digest.
pub const ANALYZE_HASH: &str = "analyze_hash";
/// Digest a file.
pub const CHECK_FILE_HASH: &str = "check_file_hash";

const LOOKUP_BASE: &str = "https://hashlookup.circl.lu/lookup";

/// Register the plugin in `registry`.
pub fn register(registry: &mut NativeModuleRegistry) {
    registry.register(SYMBOL, || Box::new(HashAnalyzerPlugin::new()));
}

/// The hash analysis plugin.
#[derive(Debug, Default)]
pub struct HashAnalyzerPlugin {
    ctx: Option<Arc<ExecutionContext>>,
}

impl HashAnalyzerPlugin {
    /// Uninitialized instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> PluginResult<&Arc<ExecutionContext>> {
        self.ctx
            .as_ref()
            .ok_or_else(|| PluginError::ExecutionFailure("hash analyzer is not initialized".into()))
    }

    async fn analyze_hash(
        &self,
        request: &PluginRequest,
        cancel: &CancellationToken,
    ) -> PluginResult<PluginResponse> {
        let ctx = self.ctx()?;
        let Some(raw) = request.param_str("hash") else {
            return Ok(PluginResponse::failure("missing required parameter 'hash'"));
        };
        let hash = raw.trim().to_ascii_lowercase();
        if !algorithm::is_hex(&hash) {
            return Ok(PluginResponse::failure("'hash' is not a hexadecimal digest"));
        }
        let Some(algorithm) = HashAlgorithm::from_hex_len(hash.len()) else {
            return Ok(PluginResponse::failure(format!(
                "no known algorithm produces a {}-character digest",
                hash.len()
            )));
        };

        let mut data = json!({
            "hash": hash,
            "algorithm": algorithm.name(),
            "bits": algorithm.bits(),
        });
        let mut citations = Vec::new();
        let mut lookup_error = None;

        if request.param_bool("lookup").unwrap_or(false) {
            if cancel.is_cancelled() {
                return Err(PluginError::Cancelled(ANALYZE_HASH.into()));
            }
            match lookup(ctx, algorithm, &hash).await {
                Ok(Some((url, record))) => {
                    data["known"] = json!(true);
                    data["lookup"] = record;
                    citations.push(Citation::new("CIRCL hashlookup").with_url(url));
                },
                Ok(None) => data["known"] = json!(false),
                Err(e) => {
                    ctx.logger().warn(&format!("hash lookup failed: {e}"));
                    lookup_error = Some(e.to_string());
                },
            }
        }

        ctx.logger()
            .debug(&format!("identified {} digest", algorithm.name()));

        let mut response = PluginResponse::success(data).with_suggestion(
            SuggestedAction::new(CHECK_FILE_HASH, "Compare a file against this digest")
                .with_param("expected", hash)
                .with_param("algorithm", algorithm.name()),
        );
        for citation in citations {
            response = response.with_citation(citation);
        }
        if let Some(error) = lookup_error {
            response = response.with_metadata("lookupError", error);
        }
        Ok(response.with_output_hash())
    }

    async fn check_file_hash(&self, request: &PluginRequest) -> PluginResult<PluginResponse> {
        let ctx = self.ctx()?;
        let Some(path) = request.param_str("path") else {
            return Ok(PluginResponse::failure("missing required parameter 'path'"));
        };
        let expected = request
            .param_str("expected")
            .map(|e| e.trim().to_ascii_lowercase());

        let algorithm = match (request.param_str("algorithm"), expected.as_deref()) {
            (Some(name), _) => HashAlgorithm::from_name(name),
            (None, Some(expected)) => HashAlgorithm::from_hex_len(expected.len()),
            (None, None) => Some(HashAlgorithm::Sha256),
        };
        let Some(algorithm) = algorithm else {
            return Ok(PluginResponse::failure("cannot determine the hash algorithm"));
        };

        let bytes = ctx.files().read(path).await?;
        let Some(digest) = algorithm.digest(&bytes) else {
            return Ok(PluginResponse::failure(format!(
                "{} digests are not computed locally; use a SHA-2 algorithm",
                algorithm.name()
            )));
        };

        let mut data = json!({
            "path": path,
            "algorithm": algorithm.name(),
            "digest": digest,
            "size": bytes.len(),
        });
        if let Some(expected) = &expected {
            data["matches"] = json!(expected == &digest);
        }
        debug!(plugin_id = %ctx.plugin_id(), path, algorithm = %algorithm, "Hashed file");

        Ok(PluginResponse::success(data)
            .with_citation(Citation::new("local file").with_excerpt(path))
            .with_suggestion(
                SuggestedAction::new(ANALYZE_HASH, "Look this digest up")
                    .with_param("hash", digest)
                    .with_param("lookup", true),
            )
            .with_output_hash())
    }
}

/// `Ok(None)` means the service does not know the digest.
async fn lookup(
    ctx: &ExecutionContext,
    algorithm: HashAlgorithm,
    hash: &str,
) -> PluginResult<Option<(String, Value)>> {
    if !ctx.has_permission(NETWORK_API) {
        return Err(PluginError::ResourceDenied {
            resource: "hashlookup.circl.lu".into(),
            reason: format!("'{NETWORK_API}' was not approved"),
        });
    }
    let Some(kind) = algorithm.lookup_kind() else {
        return Err(PluginError::ExecutionFailure(format!(
            "hashlookup does not index {} digests",
            algorithm.name()
        )));
    };

    let url = format!("{LOOKUP_BASE}/{kind}/{hash}");
    let response = ctx
        .network()
        .send(HttpRequest::get(&url).with_header("accept", "application/json"))
        .await?;
    match response.status {
        404 => Ok(None),
        _ if response.is_success() => Ok(Some((url, response.json::<Value>()?))),
        status => Err(PluginError::ExecutionFailure(format!(
            "hashlookup returned HTTP {status}"
        ))),
    }
}

#[async_trait]
impl Plugin for HashAnalyzerPlugin {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .with_intent(ANALYZE_HASH)
            .with_intent(CHECK_FILE_HASH)
            .with_file_type("*")
    }

    async fn initialize(&mut self, ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        ctx.logger().info("hash analyzer ready");
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn validate(&self) -> PluginResult<()> {
        self.ctx().map(|_| ())
    }

    async fn execute(
        &self,
        request: PluginRequest,
        cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        match request.intent.as_str() {
            ANALYZE_HASH => self.analyze_hash(&request, &cancel).await,
            CHECK_FILE_HASH => self.check_file_hash(&request).await,
            other => Ok(PluginResponse::failure(format!("unsupported intent '{other}'"))),
        }
    }

    async fn dispose(&self) -> PluginResult<()> {
        if let Some(ctx) = &self.ctx {
            ctx.logger().info("hash analyzer disposed");
        }
        Ok(())
    }
}
