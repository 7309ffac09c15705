//! `test`: load one package, execute one intent, unload.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use lantern_config::Config;
use lantern_plugins::PluginRequest;
use serde_json::Value;

use crate::settings;
use crate::theme::Theme;

pub(crate) async fn run(
    config: &Config,
    package: &Path,
    intent: &str,
    params: &[String],
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let parameters = parse_params(params)?;
    let manager = settings::manager(config).await?;

    let id = manager
        .load(package)
        .await
        .with_context(|| format!("failed to load {}", package.display()))?;
    eprintln!("{}", Theme::success(&format!("Loaded {id}")));

    let outcome = async {
        let handle = manager
            .get_plugin(&id)
            .await
            .context("plugin vanished after load")?;
        if !handle.supports_intent(intent) {
            let known: Vec<&str> = handle.intents().iter().map(String::as_str).collect();
            anyhow::bail!("{id} does not handle '{intent}' (handles: {})", known.join(", "));
        }

        let mut request = PluginRequest::new(intent).with_params(parameters);
        if let Some(secs) = timeout {
            request = request.with_timeout(Duration::from_secs(secs));
        }

        let response = handle.execute(request, settings::ctrl_c_token()).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        Ok::<_, anyhow::Error>(response.is_success())
    }
    .await;

    manager.unload(&id).await?;
    eprintln!("{}", Theme::dimmed(&format!("Unloaded {id}")));

    if outcome? {
        Ok(())
    } else {
        anyhow::bail!("'{intent}' failed")
    }
}

/// `key=value` pairs; values that parse as JSON keep their type.
pub(crate) fn parse_params(params: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    params
        .iter()
        .map(|param| {
            let (key, value) = param
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .with_context(|| format!("parameter '{param}' is not KEY=VALUE"))?;
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
            Ok((key.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn params_keep_json_types() {
        let params = parse_params(&[
            "hash=abc".into(),
            "lookup=true".into(),
            "depth=3".into(),
            "note=a=b".into(),
        ])
        .unwrap();
        assert_eq!(params["hash"], json!("abc"));
        assert_eq!(params["lookup"], json!(true));
        assert_eq!(params["depth"], json!(3));
        assert_eq!(params["note"], json!("a=b"));
    }

    #[test]
    fn params_require_a_key() {
        assert!(parse_params(&["=value".into()]).is_err());
        assert!(parse_params(&["novalue".into()]).is_err());
    }
}
