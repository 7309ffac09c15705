//! End-to-end scenario with the built-in hash analyzer.

mod common;

use lantern_plugins::{ErrorKind, PluginId, PluginRequest, PluginState};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

#[tokio::test]
async fn hash_analyzer_scenario() {
    let (ctx, manager) = common::runtime();
    let package = common::hash_package(&ctx).write_to(&ctx.packages()).unwrap();

    let id = manager.load(&package).await.unwrap();
    assert_eq!(id.as_str(), "com.lantern.hash-analyzer");
    assert_eq!(manager.state(&id).await, PluginState::Loaded);

    let info = manager.list().await;
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].version, "1.2.0");
    assert!(info[0].permissions.contains("filesystem.read"));
    assert!(info[0].permissions.contains("network.api"));

    let handles = manager.get_by_intent("analyze_hash").await;
    assert_eq!(handles.len(), 1);
    let response = handles[0]
        .execute(
            PluginRequest::new("analyze_hash").with_param("hash", EMPTY_SHA256),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(response.is_success(), "{:?}", response.error());
    assert_eq!(response.data()["algorithm"], json!("SHA-256"));
    assert_eq!(response.data()["bits"], json!(256));
    assert_eq!(response.verify_output_hash(), Some(true));

    manager.unload(&id).await.unwrap();
    assert!(manager.get_by_intent("analyze_hash").await.is_empty());
    assert!(manager.get_by_intent("check_file_hash").await.is_empty());
    assert_eq!(manager.state(&id).await, PluginState::Unloaded);
    assert_eq!(ctx.work_dir_entries(), 0);
}

#[tokio::test]
async fn file_hash_is_computed_inside_the_working_directory() {
    let (ctx, manager) = common::runtime();
    let package = common::hash_package(&ctx).write_to(&ctx.packages()).unwrap();
    let id = manager.load(&package).await.unwrap();
    let handle = manager.get_plugin(&id).await.unwrap();

    let response = handle
        .execute(
            PluginRequest::new("check_file_hash")
                .with_param("path", "samples/hello.txt")
                .with_param("expected", HELLO_SHA256),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(response.is_success(), "{:?}", response.error());
    assert_eq!(response.data()["digest"], json!(HELLO_SHA256));
    assert_eq!(response.data()["matches"], json!(true));
    assert_eq!(response.data()["size"], json!(6));

    let mismatch = handle
        .execute(
            PluginRequest::new("check_file_hash")
                .with_param("path", "samples/empty.bin")
                .with_param("expected", HELLO_SHA256),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(mismatch.is_success());
    assert_eq!(mismatch.data()["matches"], json!(false));
}

#[tokio::test]
async fn file_outside_the_sandbox_is_resource_denied() {
    let (ctx, manager) = common::runtime();
    let secret = ctx.path().join("secret.txt");
    std::fs::write(&secret, "classified").unwrap();

    let package = common::hash_package(&ctx).write_to(&ctx.packages()).unwrap();
    let id = manager.load(&package).await.unwrap();
    let handle = manager.get_plugin(&id).await.unwrap();

    for path in [secret.display().to_string(), "../../secret.txt".to_string()] {
        let response = handle
            .execute(
                PluginRequest::new("check_file_hash").with_param("path", path.as_str()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!response.is_success(), "{path} was readable");
        assert_eq!(
            response.metadata().get("errorKind"),
            Some(&json!(ErrorKind::ResourceDenied.to_string())),
            "{path}"
        );
    }
}

#[tokio::test]
async fn without_filesystem_permission_no_file_is_readable() {
    let (ctx, manager) = common::runtime();
    let package = lantern_test::PackageBuilder::new("com.lantern.hash-offline")
        .intents(["check_file_hash"])
        .native(lantern_plugin_hash::SYMBOL)
        .file("samples/empty.bin", Vec::new())
        .write_to(&ctx.packages())
        .unwrap();
    let id = manager.load(&package).await.unwrap();
    let handle = manager.get_plugin(&id).await.unwrap();

    let response = handle
        .execute(
            PluginRequest::new("check_file_hash").with_param("path", "samples/empty.bin"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!response.is_success());
    assert_eq!(
        response.metadata().get("errorKind"),
        Some(&json!("resource_denied"))
    );
    assert!(handle.supports_intent("check_file_hash"));
    assert!(!handle.supports_intent("analyze_hash"));
    assert_eq!(PluginId::new("com.lantern.hash-offline").unwrap(), id);
}
