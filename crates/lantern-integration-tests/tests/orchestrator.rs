//! Routing queries across several loaded plugins.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use lantern_plugins::{
    ErrorKind, ExtractedIntent, FixedIntentExtractor, IntentOrchestrator, PluginRequest,
    QueryContext, SummarySynthesizer,
};
use lantern_telemetry::RequestContext;
use lantern_test::{ECHO_SYMBOL, FAILING_SYMBOL, PANIC_SYMBOL, SLOW_SYMBOL};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

fn error_kind(invocation: &lantern_plugins::PluginInvocation) -> Option<String> {
    invocation
        .response
        .metadata()
        .get("errorKind")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[tokio::test]
async fn one_failure_does_not_hide_the_other_result() {
    let (ctx, manager) = common::runtime();
    for (id, symbol) in [
        ("com.test.echo", ECHO_SYMBOL),
        ("com.test.failing", FAILING_SYMBOL),
    ] {
        let package = common::mock_package(&ctx, id, symbol, &["analyze"]);
        manager.load(&package).await.unwrap();
    }

    let orchestrator =
        IntentOrchestrator::new(Arc::clone(&manager)).with_synthesizer(Arc::new(SummarySynthesizer));
    let result = orchestrator
        .route("analyze target=host-7", QueryContext::new())
        .await
        .unwrap();

    assert_eq!(result.intent, "analyze");
    assert_eq!(result.invocations.len(), 2);
    assert_eq!(result.succeeded(), 1);
    assert_eq!(result.failed(), 1);

    let echo = result
        .invocations
        .iter()
        .find(|i| i.plugin_id.as_str() == "com.test.echo")
        .unwrap();
    assert_eq!(echo.response.data()["parameters"]["target"], json!("host-7"));

    let failing = result
        .invocations
        .iter()
        .find(|i| i.plugin_id.as_str() == "com.test.failing")
        .unwrap();
    assert_eq!(error_kind(failing).as_deref(), Some("execution_failure"));

    let synthesis = result.synthesis.unwrap();
    assert!(synthesis.starts_with("1 of 2 plugins succeeded for 'analyze'"), "{synthesis}");
}

#[tokio::test]
async fn panicking_plugin_is_contained() {
    let (ctx, manager) = common::runtime();
    for (id, symbol) in [("com.test.echo", ECHO_SYMBOL), ("com.test.panic", PANIC_SYMBOL)] {
        let package = common::mock_package(&ctx, id, symbol, &["echo"]);
        manager.load(&package).await.unwrap();
    }

    let orchestrator = IntentOrchestrator::new(Arc::clone(&manager));
    let result = orchestrator
        .dispatch(PluginRequest::new("echo"), QueryContext::new())
        .await;
    assert_eq!(result.succeeded(), 1);
    assert_eq!(result.failed(), 1);

    // The panicking plugin stays registered and the runtime keeps serving.
    assert_eq!(manager.len().await, 2);
    let again = orchestrator
        .dispatch(PluginRequest::new("echo"), QueryContext::new())
        .await;
    assert_eq!(again.invocations.len(), 2);
}

#[tokio::test]
async fn slow_plugin_times_out_without_blocking_fast_ones() {
    let (ctx, manager) = common::runtime();
    for (id, symbol) in [("com.test.echo", ECHO_SYMBOL), ("com.test.slow", SLOW_SYMBOL)] {
        let package = common::mock_package(&ctx, id, symbol, &["analyze"]);
        manager.load(&package).await.unwrap();
    }

    let orchestrator = IntentOrchestrator::new(Arc::clone(&manager));
    let started = Instant::now();
    let result = orchestrator
        .dispatch(
            PluginRequest::new("analyze"),
            QueryContext::new().with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let slow = result
        .invocations
        .iter()
        .find(|i| i.plugin_id.as_str() == "com.test.slow")
        .unwrap();
    assert!(!slow.response.is_success());
    assert_eq!(
        error_kind(slow).as_deref(),
        Some(ErrorKind::ExecutionFailure.to_string().as_str())
    );
    assert_eq!(result.succeeded(), 1);
}

#[tokio::test]
async fn cancelling_the_query_cancels_every_invocation() {
    let (ctx, manager) = common::runtime();
    for id in ["com.test.slow-a", "com.test.slow-b"] {
        let package = common::mock_package(&ctx, id, SLOW_SYMBOL, &["analyze"]);
        manager.load(&package).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let orchestrator = IntentOrchestrator::new(Arc::clone(&manager));
    let result = orchestrator
        .dispatch(
            PluginRequest::new("analyze"),
            QueryContext::new().with_cancellation(cancel),
        )
        .await;
    assert_eq!(result.invocations.len(), 2);
    assert_eq!(result.failed(), 2);
}

#[tokio::test]
async fn unknown_intent_yields_an_empty_result() {
    let (ctx, manager) = common::runtime();
    let package = common::mock_package(&ctx, "com.test.echo", ECHO_SYMBOL, &["echo"]);
    manager.load(&package).await.unwrap();

    let orchestrator =
        IntentOrchestrator::new(Arc::clone(&manager)).with_synthesizer(Arc::new(SummarySynthesizer));
    let result = orchestrator
        .route("geolocate ip=10.0.0.1", QueryContext::new())
        .await
        .unwrap();
    assert!(result.is_empty());
    assert!(result.synthesis.is_none());
}

#[tokio::test]
async fn empty_query_is_an_extraction_error() {
    let (_ctx, manager) = common::runtime();
    let orchestrator = IntentOrchestrator::new(manager);
    let err = orchestrator.route("  ", QueryContext::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
}

#[tokio::test]
async fn route_carries_correlation_and_case() {
    let (ctx, manager) = common::runtime();
    let package = common::mock_package(&ctx, "com.test.echo", ECHO_SYMBOL, &["echo"]);
    manager.load(&package).await.unwrap();

    let request = RequestContext::new("integration").with_operation("route");
    let correlation_id = request.correlation_id;
    let orchestrator = IntentOrchestrator::new(Arc::clone(&manager)).with_extractor(Arc::new(
        FixedIntentExtractor::new(ExtractedIntent::new("echo").with_param("depth", 2)),
    ));
    let result = orchestrator
        .route(
            "who touched this file",
            QueryContext::new()
                .with_request(request)
                .with_case("case-42")
                .with_user("analyst"),
        )
        .await
        .unwrap();

    assert_eq!(result.correlation_id, correlation_id);
    assert_eq!(result.parameters["depth"], json!(2));
    assert_eq!(result.parameters["query"], json!("who touched this file"));
    assert_eq!(result.succeeded(), 1);

    let serialized = serde_json::to_value(&result).unwrap();
    assert!(serialized["invocations"][0]["elapsedMs"].is_u64());
    assert_eq!(serialized["invocations"][0]["pluginId"], json!("com.test.echo"));
}

#[tokio::test]
async fn hash_query_reaches_the_hash_analyzer() {
    let (ctx, manager) = common::runtime();
    let package = common::hash_package(&ctx).write_to(&ctx.packages()).unwrap();
    manager.load(&package).await.unwrap();
    let echo = common::mock_package(&ctx, "com.test.echo", ECHO_SYMBOL, &["echo"]);
    manager.load(&echo).await.unwrap();

    let orchestrator = IntentOrchestrator::new(Arc::clone(&manager));
    let result = orchestrator
        .route(&format!("analyze_hash hash={EMPTY_SHA256}"), QueryContext::new())
        .await
        .unwrap();
    assert_eq!(result.invocations.len(), 1);
    let invocation = &result.invocations[0];
    assert_eq!(invocation.plugin_name, "Hash Analyzer");
    assert!(invocation.response.is_success());
    assert_eq!(invocation.response.data()["algorithm"], json!("SHA-256"));
}
