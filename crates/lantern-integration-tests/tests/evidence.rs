//! Evidence storage and per-plugin settings through a config-built manager.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use lantern_config::Config;
use lantern_plugins::{
    Capabilities, ExecutionContext, NativeModuleRegistry, Plugin, PluginError, PluginManager,
    PluginRequest, PluginResponse, PluginResult,
};
use lantern_storage::FsEvidenceStore;
use lantern_test::{PackageBuilder, TestContext};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const ARCHIVIST: &str = "integration.archivist";

/// Stores notes as evidence under a key taken from its settings.
#[derive(Default)]
struct Archivist {
    ctx: Option<Arc<ExecutionContext>>,
}

#[async_trait]
impl Plugin for Archivist {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new().with_intent("archive").with_intent("recall")
    }

    async fn initialize(&mut self, ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn execute(
        &self,
        request: PluginRequest,
        _cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| PluginError::ExecutionFailure("not initialized".into()))?;
        let key = ctx
            .config()
            .get_str("label")
            .unwrap_or_else(|| "note".to_string());

        match request.intent.as_str() {
            "archive" => {
                let note = request.param_str("note").unwrap_or_default();
                let record = ctx.evidence().store(&key, note.as_bytes().to_vec()).await?;
                Ok(PluginResponse::success(json!({
                    "namespace": ctx.evidence().namespace(),
                    "key": key,
                    "size": record.size,
                })))
            },
            _ => {
                let data = ctx.evidence().load(&key).await?;
                Ok(PluginResponse::success(json!({
                    "key": key,
                    "note": data.map(|d| String::from_utf8_lossy(&d).into_owned()),
                })))
            },
        }
    }
}

fn write_config(ctx: &TestContext) -> Config {
    let root = ctx.path();
    let toml = format!(
        r#"
[plugins]
work_dir = '{work}'
allowed_permissions = ["evidence.read", "evidence.write", "filesystem.read"]
drain_timeout_secs = 2

[sandbox]
temp_root = '{tmp}'

[evidence]
root = '{evidence}'

[settings."com.test.archivist"]
label = "finding"
"#,
        work = ctx.work_dir().display(),
        tmp = ctx.temp_root().display(),
        evidence = root.join("evidence").display(),
    );
    let path = root.join("lantern.toml");
    std::fs::write(&path, toml).unwrap();
    Config::load_file(&path).unwrap()
}

async fn manager(config: &Config) -> PluginManager {
    let store = FsEvidenceStore::open(config.evidence.root.clone().unwrap())
        .await
        .unwrap();
    PluginManager::from_config(config)
        .native_modules(
            NativeModuleRegistry::new().with(ARCHIVIST, || Box::new(Archivist::default())),
        )
        .evidence_store(Arc::new(store))
        .build()
}

fn archivist_package(ctx: &TestContext, id: &str, permissions: &[&str]) -> std::path::PathBuf {
    permissions
        .iter()
        .fold(PackageBuilder::new(id), |p, perm| p.permission(perm))
        .intents(["archive", "recall"])
        .native(ARCHIVIST)
        .write_to(&ctx.packages())
        .unwrap()
}

async fn run(manager: &PluginManager, id: &str, request: PluginRequest) -> PluginResponse {
    let id = lantern_plugins::PluginId::new(id).unwrap();
    manager
        .get_plugin(&id)
        .await
        .unwrap()
        .execute(request, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn evidence_lands_in_the_plugin_namespace() {
    let ctx = TestContext::new();
    let config = write_config(&ctx);
    let manager = manager(&config).await;
    let package = archivist_package(&ctx, "com.test.archivist", &["evidence.read", "evidence.write"]);
    manager.load(&package).await.unwrap();

    let stored = run(
        &manager,
        "com.test.archivist",
        PluginRequest::new("archive").with_param("note", "beacon every 60s"),
    )
    .await;
    assert!(stored.is_success(), "{:?}", stored.error());
    assert_eq!(stored.data()["key"], json!("finding"));
    assert_eq!(stored.data()["size"], json!(16));

    let namespace = stored.data()["namespace"].as_str().unwrap().to_string();
    let on_disk = ctx.path().join("evidence").join(&namespace).join("finding");
    assert_eq!(std::fs::read_to_string(on_disk).unwrap(), "beacon every 60s");

    let recalled = run(&manager, "com.test.archivist", PluginRequest::new("recall")).await;
    assert_eq!(recalled.data()["note"], json!("beacon every 60s"));

    manager.unload_all().await;
    // Evidence outlives the plugin.
    assert!(ctx.path().join("evidence").join(&namespace).join("finding").exists());
}

#[tokio::test]
async fn evidence_is_isolated_between_plugins() {
    let ctx = TestContext::new();
    let config = write_config(&ctx);
    let manager = manager(&config).await;
    for id in ["com.test.archivist", "com.test.other-archivist"] {
        let package = archivist_package(&ctx, id, &["evidence.read", "evidence.write"]);
        manager.load(&package).await.unwrap();
    }

    run(
        &manager,
        "com.test.archivist",
        PluginRequest::new("archive").with_param("note", "private"),
    )
    .await;

    // The other plugin has no `label` setting, so it reads "note"; it cannot
    // see the first plugin's key under any name.
    let other = run(&manager, "com.test.other-archivist", PluginRequest::new("recall")).await;
    assert!(other.is_success());
    assert_eq!(other.data()["key"], json!("note"));
    assert_eq!(other.data()["note"], json!(null));
}

#[tokio::test]
async fn evidence_write_requires_permission() {
    let ctx = TestContext::new();
    let config = write_config(&ctx);
    let manager = manager(&config).await;
    let package = archivist_package(&ctx, "com.test.archivist", &["evidence.read"]);
    manager.load(&package).await.unwrap();

    let denied = run(
        &manager,
        "com.test.archivist",
        PluginRequest::new("archive").with_param("note", "x"),
    )
    .await;
    assert!(!denied.is_success());
    assert_eq!(denied.metadata().get("errorKind"), Some(&json!("resource_denied")));

    let recalled = run(&manager, "com.test.archivist", PluginRequest::new("recall")).await;
    assert!(recalled.is_success());
}

#[tokio::test]
async fn config_file_drives_manager_settings() {
    let ctx = TestContext::new();
    let config = write_config(&ctx);
    let manager = manager(&config).await;
    assert_eq!(manager.settings().work_dir, ctx.work_dir());
    assert_eq!(manager.settings().drain_timeout.as_secs(), 2);

    common::mock_package(&ctx, "com.test.echo", lantern_test::ECHO_SYMBOL, &["echo"]);
    // The mock symbols are not registered in this manager.
    let report = manager
        .try_load(&ctx.packages().join("com.test.echo.lpkg"))
        .await;
    assert!(!report.success);
}
