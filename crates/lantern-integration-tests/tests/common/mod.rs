//! Shared setup for the integration suites.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use lantern_plugins::{NativeModuleRegistry, PluginManager};
use lantern_test::{PackageBuilder, TestContext, mock_registry, setup_test_logging};

/// Mocks plus the built-in hash analyzer.
pub fn native_modules() -> NativeModuleRegistry {
    let mut registry = mock_registry();
    lantern_plugin_hash::register(&mut registry);
    registry
}

/// A context and a shared manager over [`native_modules`].
pub fn runtime() -> (TestContext, Arc<PluginManager>) {
    setup_test_logging("lantern_plugins=debug");
    let ctx = TestContext::new();
    let manager = Arc::new(ctx.manager(native_modules()));
    (ctx, manager)
}

/// Write a package for one of the mock symbols handling `intents`.
pub fn mock_package(ctx: &TestContext, id: &str, symbol: &str, intents: &[&str]) -> PathBuf {
    PackageBuilder::new(id)
        .intents(intents.iter().copied())
        .native(symbol)
        .write_to(&ctx.packages())
        .unwrap()
}

/// The hash analyzer package as an investigator would ship it.
pub fn hash_package(ctx: &TestContext) -> PackageBuilder {
    PackageBuilder::new("com.lantern.hash-analyzer")
        .name("Hash Analyzer")
        .version("1.2.0")
        .category("forensics")
        .intents([
            lantern_plugin_hash::ANALYZE_HASH,
            lantern_plugin_hash::CHECK_FILE_HASH,
        ])
        .permission("filesystem.read")
        .permission("network.api")
        .requires_internet()
        .native(lantern_plugin_hash::SYMBOL)
        .file("samples/empty.bin", Vec::new())
        .file("samples/hello.txt", b"hello\n".to_vec())
        .manifest_value("description", serde_json::json!(format!(
            "hash triage for {}",
            ctx.path().display()
        )))
}
