use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::manifest;
use crate::package::write_package;
use crate::request::{PluginRequest, PluginResponse};

// ---------------------------------------------------------------------------
// Test plugins
// ---------------------------------------------------------------------------

/// Echoes its parameters back; optionally sleeps first.
struct Echo {
    intents: &'static [&'static str],
    delay: Duration,
    disposed: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for Echo {
    fn capabilities(&self) -> Capabilities {
        self.intents
            .iter()
            .fold(Capabilities::new(), |caps, intent| caps.with_intent(*intent))
    }

    async fn initialize(&mut self, _ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        request: PluginRequest,
        cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => {},
            () = cancel.cancelled() => return Err(PluginError::Cancelled("echo".into())),
        }
        Ok(PluginResponse::success(json!(request.parameters)))
    }

    async fn dispose(&self) -> PluginResult<()> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingInit;

#[async_trait]
impl Plugin for FailingInit {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new().with_intent("echo")
    }

    async fn initialize(&mut self, _ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        Err(PluginError::ExecutionFailure("no database".into()))
    }

    async fn execute(
        &self,
        _request: PluginRequest,
        _cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        unreachable!("never initialized")
    }
}

/// Declares whatever capabilities it was built with and panics on execute.
struct Posture(Capabilities);

#[async_trait]
impl Plugin for Posture {
    fn capabilities(&self) -> Capabilities {
        self.0.clone()
    }

    async fn initialize(&mut self, _ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        _request: PluginRequest,
        _cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        panic!("boom")
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    _root: TempDir,
    packages: PathBuf,
    work: PathBuf,
    disposed: Arc<AtomicUsize>,
    manager: PluginManager,
}

fn fixture(settings: impl FnOnce(ManagerSettings) -> ManagerSettings) -> Fixture {
    let root = TempDir::new().unwrap();
    let packages = root.path().join("packages");
    let work = root.path().join("work");
    std::fs::create_dir_all(&packages).unwrap();

    let disposed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disposed);
    let counter_slow = Arc::clone(&disposed);
    let native = NativeModuleRegistry::new()
        .with("test.echo", move || {
            Box::new(Echo {
                intents: &["echo"],
                delay: Duration::ZERO,
                disposed: Arc::clone(&counter),
            })
        })
        .with("test.slow", move || {
            Box::new(Echo {
                intents: &["echo"],
                delay: Duration::from_millis(300),
                disposed: Arc::clone(&counter_slow),
            })
        })
        .with("test.failing-init", || Box::new(FailingInit))
        .with("test.partial", || {
            Box::new(Posture(Capabilities::new().with_intent("a").with_intent("z")))
        })
        .with("test.privileged", || {
            Box::new(Posture(
                Capabilities::new()
                    .with_intent("echo")
                    .with_elevated_privilege(),
            ))
        })
        .with("test.online", || {
            Box::new(Posture(Capabilities::new().with_intent("echo").with_network()))
        });

    let manager = PluginManager::builder()
        .settings(settings(
            ManagerSettings::default()
                .with_work_dir(&work)
                .with_drain_timeout(Duration::from_secs(5)),
        ))
        .sandbox_settings(SandboxSettings::default().with_temp_root(root.path().join("tmp")))
        .native_modules(native)
        .build();

    Fixture {
        _root: root,
        packages,
        work,
        disposed,
        manager,
    }
}

fn package(fx: &Fixture, id: &str, symbol: &str, intents: &[&str], permissions: &[&str]) -> PathBuf {
    let manifest = manifest::parse(
        json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "description": "test plugin",
            "author": { "name": "tests" },
            "permissions": permissions,
            "capabilities": { "intents": intents },
        })
        .to_string()
        .as_bytes(),
    )
    .unwrap();
    let mut files = BTreeMap::new();
    files.insert(
        "plugin.native".to_string(),
        json!({ "symbol": symbol }).to_string().into_bytes(),
    );
    let path = fx.packages.join(format!("{id}.lpkg"));
    write_package(&path, &manifest, &files).unwrap();
    path
}

fn work_dir_entries(fx: &Fixture) -> usize {
    std::fs::read_dir(&fx.work).map_or(0, Iterator::count)
}

fn id(s: &str) -> PluginId {
    PluginId::from_static(s)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

#[tokio::test]
async fn load_registers_and_routes_by_intent() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.echo", "test.echo", &["echo"], &[]);

    let loaded = fx.manager.load(&path).await.unwrap();
    assert_eq!(loaded, id("com.test.echo"));
    assert_eq!(fx.manager.state(&loaded).await, PluginState::Loaded);
    assert_eq!(fx.manager.len().await, 1);

    let handles = fx.manager.get_by_intent("echo").await;
    assert_eq!(handles.len(), 1);
    let response = handles[0]
        .execute(
            PluginRequest::new("echo").with_param("q", "x"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(response.data(), &json!({ "q": "x" }));

    let dir = fx.manager.working_dir(&loaded).await.unwrap();
    assert!(dir.starts_with(&fx.work));
    assert!(dir.join("plugin.native").exists());
}

#[tokio::test]
async fn duplicate_load_is_rejected_without_side_effects() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.echo", "test.echo", &["echo"], &[]);
    fx.manager.load(&path).await.unwrap();

    let err = fx.manager.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::AlreadyLoaded(ref dup) if dup == &id("com.test.echo")));
    assert_eq!(fx.manager.len().await, 1);
    assert_eq!(work_dir_entries(&fx), 1);
    assert_eq!(fx.manager.state(&id("com.test.echo")).await, PluginState::Loaded);
}

#[tokio::test]
async fn try_load_reports_reason() {
    let fx = fixture(|s| s);
    let report = fx.manager.try_load(&fx.packages.join("absent.lpkg")).await;
    assert!(!report.success);
    assert!(report.reason.is_some());
    assert_eq!(report.kind, Some(crate::error::ErrorKind::PolicyRejected));
}

#[tokio::test]
async fn failed_initialize_leaves_nothing_behind() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.bad", "test.failing-init", &["echo"], &[]);

    let err = fx.manager.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::InitializationFailed { .. }));
    assert!(fx.manager.is_empty().await);
    assert!(fx.manager.get_by_intent("echo").await.is_empty());
    assert_eq!(work_dir_entries(&fx), 0);
    assert!(matches!(
        fx.manager.state(&id("com.test.bad")).await,
        PluginState::Failed(_)
    ));
}

#[tokio::test]
async fn unregistered_native_symbol_is_not_an_implementation() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.orphan", "test.nowhere", &["echo"], &[]);

    let err = fx.manager.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::NoPluginImplementationFound { .. }));
    assert_eq!(work_dir_entries(&fx), 0);
}

#[tokio::test]
async fn denied_permission_fails_validation() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.root", "test.echo", &["echo"], &["system.admin"]);

    let err = fx.manager.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::PolicyRejected { .. }));
    assert!(fx.manager.is_empty().await);
}

// ---------------------------------------------------------------------------
// Capability negotiation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn routed_intents_are_the_intersection() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.partial", "test.partial", &["a", "b"], &[]);
    fx.manager.load(&path).await.unwrap();

    assert_eq!(fx.manager.get_by_intent("a").await.len(), 1);
    assert!(fx.manager.get_by_intent("b").await.is_empty());
    assert!(fx.manager.get_by_intent("z").await.is_empty());
}

#[tokio::test]
async fn elevated_privilege_is_never_granted() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.priv", "test.privileged", &["echo"], &[]);

    let err = fx.manager.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::PolicyRejected { .. }));
    assert_eq!(work_dir_entries(&fx), 0);
}

#[tokio::test]
async fn network_needs_the_network_permission() {
    let fx = fixture(|s| s);
    let denied = package(&fx, "com.test.offline", "test.online", &["echo"], &[]);
    assert!(matches!(
        fx.manager.load(&denied).await,
        Err(PluginError::PolicyRejected { .. })
    ));

    let allowed = package(&fx, "com.test.online", "test.online", &["echo"], &["network.api"]);
    fx.manager.load(&allowed).await.unwrap();
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_becomes_a_failed_response() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.slow", "test.slow", &["echo"], &[]);
    fx.manager.load(&path).await.unwrap();

    let handle = fx.manager.get_plugin(&id("com.test.slow")).await.unwrap();
    let response = handle
        .execute(
            PluginRequest::new("echo").with_timeout(Duration::from_millis(20)),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!response.is_success());
    assert!(response.error().unwrap().contains("timed out"));
}

#[tokio::test]
async fn panic_is_contained() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.online", "test.online", &["echo"], &["network.api"]);
    fx.manager.load(&path).await.unwrap();

    let handle = fx.manager.get_plugin(&id("com.test.online")).await.unwrap();
    let response = handle
        .execute(PluginRequest::new("echo"), CancellationToken::new())
        .await
        .unwrap();
    assert!(!response.is_success());
    assert_eq!(
        response.metadata().get("errorKind"),
        Some(&json!("execution_failure"))
    );
    assert_eq!(fx.manager.state(&id("com.test.online")).await, PluginState::Loaded);
}

#[tokio::test]
async fn unrouted_intent_is_a_failed_response() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.echo", "test.echo", &["echo"], &[]);
    fx.manager.load(&path).await.unwrap();

    let handle = fx.manager.get_plugin(&id("com.test.echo")).await.unwrap();
    let response = handle
        .execute(PluginRequest::new("other"), CancellationToken::new())
        .await
        .unwrap();
    assert!(!response.is_success());
}

// ---------------------------------------------------------------------------
// Unload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unload_cleans_up_and_stale_handles_fail() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.echo", "test.echo", &["echo"], &[]);
    fx.manager.load(&path).await.unwrap();
    let handle = fx.manager.get_plugin(&id("com.test.echo")).await.unwrap();

    fx.manager.unload(&id("com.test.echo")).await.unwrap();

    assert!(fx.manager.is_empty().await);
    assert!(fx.manager.get_by_intent("echo").await.is_empty());
    assert_eq!(work_dir_entries(&fx), 0);
    assert_eq!(fx.disposed.load(Ordering::SeqCst), 1);
    assert_eq!(fx.manager.state(&id("com.test.echo")).await, PluginState::Unloaded);
    assert!(handle.is_unloaded());
    assert!(matches!(
        handle
            .execute(PluginRequest::new("echo"), CancellationToken::new())
            .await,
        Err(PluginError::NotLoaded(_))
    ));

    // Reload after unload is allowed.
    fx.manager.load(&path).await.unwrap();
}

#[tokio::test]
async fn unload_unknown_is_not_loaded() {
    let fx = fixture(|s| s);
    let report = fx.manager.try_unload(&id("ghost")).await;
    assert!(!report.success);
    assert_eq!(report.kind, Some(crate::error::ErrorKind::NotLoaded));
}

#[tokio::test]
async fn unload_waits_for_in_flight_executions() {
    let fx = fixture(|s| s);
    let path = package(&fx, "com.test.slow", "test.slow", &["echo"], &[]);
    fx.manager.load(&path).await.unwrap();
    let handle = fx.manager.get_plugin(&id("com.test.slow")).await.unwrap();

    let running = tokio::spawn(async move {
        handle
            .execute(PluginRequest::new("echo"), CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    fx.manager.unload(&id("com.test.slow")).await.unwrap();
    let response = running.await.unwrap().unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn drain_timeout_cancels_stragglers() {
    let fx = fixture(|s| s.with_drain_timeout(Duration::from_millis(30)));
    let path = package(&fx, "com.test.slow", "test.slow", &["echo"], &[]);
    fx.manager.load(&path).await.unwrap();
    let handle = fx.manager.get_plugin(&id("com.test.slow")).await.unwrap();

    let running = tokio::spawn(async move {
        handle
            .execute(PluginRequest::new("echo"), CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    fx.manager.unload(&id("com.test.slow")).await.unwrap();
    let response = running.await.unwrap().unwrap();
    assert!(!response.is_success());
}

#[tokio::test]
async fn unload_all_empties_registry() {
    let fx = fixture(|s| s);
    fx.manager
        .load(&package(&fx, "com.test.echo", "test.echo", &["echo"], &[]))
        .await
        .unwrap();
    fx.manager
        .load(&package(&fx, "com.test.partial", "test.partial", &["a"], &[]))
        .await
        .unwrap();

    let reports = fx.manager.unload_all().await;
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.success));
    assert!(fx.manager.is_empty().await);
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discover_marks_loaded_packages() {
    let fx = fixture(|s| s);
    let echo = package(&fx, "com.test.echo", "test.echo", &["echo"], &[]);
    package(&fx, "com.test.partial", "test.partial", &["a"], &[]);
    fx.manager.load(&echo).await.unwrap();

    let found = fx.manager.discover(&fx.packages).await.unwrap();
    assert_eq!(found.len(), 2);
    let loaded: Vec<_> = found.iter().filter(|p| p.loaded).map(|p| p.id.as_str()).collect();
    assert_eq!(loaded, vec!["com.test.echo"]);
}

#[tokio::test]
async fn load_directory_reports_each_package() {
    let fx = fixture(|s| s);
    package(&fx, "com.test.echo", "test.echo", &["echo"], &[]);
    package(&fx, "com.test.bad", "test.failing-init", &["echo"], &[]);

    let reports = fx.manager.load_directory(&fx.packages).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().filter(|r| r.success).count(), 1);
    assert_eq!(fx.manager.len().await, 1);
}

#[tokio::test]
async fn timed_out_hook_is_aborted() {
    let resumed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&resumed);
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert!(await_hook(task, Duration::from_millis(20)).await.is_none());
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(resumed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn finished_hook_returns_its_output() {
    let task = tokio::spawn(async { 7 });
    let joined = await_hook(task, Duration::from_secs(1)).await;
    assert_eq!(joined.unwrap().unwrap(), 7);
}
