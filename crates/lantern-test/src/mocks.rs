//! Mock plugins for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lantern_plugins::{
    Capabilities, ExecutionContext, NativeModuleRegistry, Plugin, PluginError, PluginRequest,
    PluginResponse, PluginResult,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Native symbol of an echo plugin handling `echo` and `analyze`.
pub const ECHO_SYMBOL: &str = "mock.echo";
/// Native symbol of a plugin whose executions always fail.
pub const FAILING_SYMBOL: &str = "mock.failing";
/// Native symbol of an echo plugin that takes 200ms per execution.
pub const SLOW_SYMBOL: &str = "mock.slow";
/// Native symbol of a plugin that panics on execute.
pub const PANIC_SYMBOL: &str = "mock.panic";
/// Native symbol of a plugin whose `initialize` fails.
pub const BROKEN_INIT_SYMBOL: &str = "mock.broken-init";

/// How a [`MockPlugin`] responds.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return the request parameters as data.
    Echo,
    /// Return an error with this message.
    Fail(String),
    /// Panic.
    Panic,
}

/// Counters shared between a mock and the test observing it.
#[derive(Debug, Default)]
pub struct MockStats {
    initialized: AtomicUsize,
    initialize_finished: AtomicUsize,
    executed: AtomicUsize,
    disposed: AtomicUsize,
    last_request: Mutex<Option<PluginRequest>>,
}

impl MockStats {
    /// Times `initialize` ran.
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Times `initialize` ran to completion, including any hang.
    pub fn initialize_finished(&self) -> usize {
        self.initialize_finished.load(Ordering::SeqCst)
    }

    /// Executions started.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Times `dispose` ran.
    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Most recent request.
    pub fn last_request(&self) -> Option<PluginRequest> {
        self.last_request.lock().ok().and_then(|r| r.clone())
    }
}

/// A configurable plugin.
#[derive(Debug, Clone)]
pub struct MockPlugin {
    capabilities: Capabilities,
    behavior: MockBehavior,
    delay: Duration,
    initialize_delay: Duration,
    fail_initialize: bool,
    stats: Arc<MockStats>,
}

impl MockPlugin {
    /// An echo plugin for `intents`.
    #[must_use]
    pub fn echo<'a>(intents: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            capabilities: intents
                .into_iter()
                .fold(Capabilities::new(), Capabilities::with_intent),
            behavior: MockBehavior::Echo,
            delay: Duration::ZERO,
            initialize_delay: Duration::ZERO,
            fail_initialize: false,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Change the behavior.
    #[must_use]
    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Sleep before responding. Cancellation cuts the sleep short.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `initialize` fail.
    #[must_use]
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Make `initialize` sleep for `delay` before returning.
    #[must_use]
    pub fn hanging_initialize(mut self, delay: Duration) -> Self {
        self.initialize_delay = delay;
        self
    }

    /// Replace the declared capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Share counters with an existing mock, so a factory can hand out
    /// instances the test can still observe.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<MockStats>) -> Self {
        self.stats = stats;
        self
    }

    /// The counters.
    #[must_use]
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn initialize(&mut self, _ctx: Arc<ExecutionContext>) -> PluginResult<()> {
        self.stats.initialized.fetch_add(1, Ordering::SeqCst);
        if !self.initialize_delay.is_zero() {
            tokio::time::sleep(self.initialize_delay).await;
        }
        self.stats.initialize_finished.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(PluginError::ExecutionFailure("mock initialize failure".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: PluginRequest,
        cancel: CancellationToken,
    ) -> PluginResult<PluginResponse> {
        self.stats.executed.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.stats.last_request.lock() {
            *last = Some(request.clone());
        }

        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {},
                () = cancel.cancelled() => {
                    return Err(PluginError::Cancelled(format!("mock {}", request.intent)));
                },
            }
        }

        match &self.behavior {
            MockBehavior::Echo => Ok(PluginResponse::success(json!({
                "intent": request.intent,
                "parameters": request.parameters,
            }))),
            MockBehavior::Fail(message) => Err(PluginError::ExecutionFailure(message.clone())),
            MockBehavior::Panic => panic!("mock plugin panic"),
        }
    }

    async fn dispose(&self) -> PluginResult<()> {
        self.stats.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A native registry holding the standard mocks under the `*_SYMBOL`
/// constants. All of them handle `echo` and `analyze`.
#[must_use]
pub fn mock_registry() -> NativeModuleRegistry {
    const INTENTS: [&str; 2] = ["echo", "analyze"];
    NativeModuleRegistry::new()
        .with(ECHO_SYMBOL, || Box::new(MockPlugin::echo(INTENTS)))
        .with(FAILING_SYMBOL, || {
            Box::new(
                MockPlugin::echo(INTENTS)
                    .with_behavior(MockBehavior::Fail("mock execution failure".into())),
            )
        })
        .with(SLOW_SYMBOL, || {
            Box::new(MockPlugin::echo(INTENTS).with_delay(Duration::from_millis(200)))
        })
        .with(PANIC_SYMBOL, || {
            Box::new(MockPlugin::echo(INTENTS).with_behavior(MockBehavior::Panic))
        })
        .with(BROKEN_INIT_SYMBOL, || {
            Box::new(MockPlugin::echo(INTENTS).failing_initialize())
        })
}

/// Register a factory handing out clones of `plugin` under `symbol`.
/// The clones share `plugin`'s [`MockStats`].
pub fn register_mock(registry: &mut NativeModuleRegistry, symbol: &str, plugin: MockPlugin) {
    registry.register(symbol, move || Box::new(plugin.clone()));
}
