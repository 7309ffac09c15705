//! `route`: load a directory of packages and route one query across them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lantern_config::Config;
use lantern_plugins::{IntentOrchestrator, QueryContext, SummarySynthesizer};
use lantern_telemetry::RequestContext;

use crate::settings;
use crate::theme::Theme;

pub(crate) async fn run(
    config: &Config,
    query: &str,
    dir: Option<PathBuf>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let dir = settings::plugin_dir(config, dir)?;
    let manager = Arc::new(settings::manager(config).await?);

    for report in manager.load_directory(&dir).await? {
        let id = report
            .plugin_id
            .as_ref()
            .map_or_else(|| "?".to_string(), ToString::to_string);
        match &report.reason {
            None => eprintln!("{}", Theme::success(&format!("Loaded {id}"))),
            Some(reason) => eprintln!("{}", Theme::warning(&format!("Skipped {id}: {reason}"))),
        }
    }

    let orchestrator = IntentOrchestrator::new(Arc::clone(&manager))
        .with_config(&config.orchestrator)
        .with_synthesizer(Arc::new(SummarySynthesizer));

    let mut ctx = QueryContext::new()
        .with_request(RequestContext::new("cli").with_operation("route"))
        .with_cancellation(settings::ctrl_c_token());
    if let Some(secs) = timeout {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }

    let routed = orchestrator.route(query, ctx).await;
    for report in manager.unload_all().await {
        if let Some(reason) = report.reason {
            eprintln!("{}", Theme::warning(&format!("Unload failed: {reason}")));
        }
    }
    let result = routed?;

    if result.is_empty() {
        eprintln!(
            "{}",
            Theme::info(&format!("No loaded plugin handles '{}'", result.intent))
        );
    }
    if let Some(summary) = &result.synthesis {
        eprintln!("{summary}");
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
