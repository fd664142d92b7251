pub mod auto_forward;
pub mod commands;
pub mod media_logger;
pub mod welcome;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::platform::NormalizedEvent;

pub use auto_forward::AutoForwardPlugin;
pub use commands::CommandPlugin;
pub use media_logger::MediaLoggerPlugin;
pub use welcome::WelcomePlugin;

/// A handler that sees every routed event and may rewrite its text or media
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn process_message(&self, event: &mut NormalizedEvent) -> Result<()>;

    /// One-time setup, run in the background right after registration
    async fn init(&self) -> Result<()> {
        Ok(())
    }
}

/// Ordered, fault-isolated list of plugins.
///
/// Registration happens at startup; afterwards the pipeline is shared
/// read-only, so events can be processed concurrently without locking.
#[derive(Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin and run its `init` once in the background.
    ///
    /// A failing `init` is logged and the plugin stays registered.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> JoinHandle<()> {
        info!("Registered plugin: {}", plugin.name());
        self.plugins.push(Arc::clone(&plugin));

        tokio::spawn(async move {
            match AssertUnwindSafe(plugin.init()).catch_unwind().await {
                Ok(Ok(())) => debug!("Plugin '{}' initialized", plugin.name()),
                Ok(Err(e)) => error!("Plugin '{}' failed to initialize: {:#}", plugin.name(), e),
                Err(panic) => error!(
                    "Plugin '{}' panicked during initialization: {}",
                    plugin.name(),
                    panic_message(panic.as_ref())
                ),
            }
        })
    }

    /// Run every plugin, in registration order, against `event`.
    /// Returns how many plugins failed; a failure never stops the pass.
    pub async fn process(&self, event: &mut NormalizedEvent) -> usize {
        let mut failures = 0;

        for plugin in &self.plugins {
            let outcome = AssertUnwindSafe(plugin.process_message(event))
                .catch_unwind()
                .await;

            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };

            failures += 1;
            error!(
                "Error in plugin '{}' for {}({}): {}",
                plugin.name(),
                event.platform(),
                event.chat_id(),
                reason
            );
        }

        failures
    }

    pub fn count(&self) -> usize {
        self.plugins.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Appends its name to the text and records what it saw
    struct Appender {
        name: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl Appender {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Plugin for Appender {
        fn name(&self) -> &str {
            self.name
        }

        async fn process_message(&self, event: &mut NormalizedEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.text.clone());
            event.text.push_str(self.name);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process_message(&self, _event: &mut NormalizedEvent) -> Result<()> {
            bail!("boom")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Plugin for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn process_message(&self, _event: &mut NormalizedEvent) -> Result<()> {
            panic!("plugin bug")
        }
    }

    struct CountingInit {
        inits: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for CountingInit {
        fn name(&self) -> &str {
            "counting-init"
        }

        async fn process_message(&self, _event: &mut NormalizedEvent) -> Result<()> {
            Ok(())
        }

        async fn init(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("init failed");
            }
            Ok(())
        }
    }

    fn event() -> NormalizedEvent {
        NormalizedEvent::new(Platform::Telegram, "c1", "u1", false, "")
    }

    #[tokio::test]
    async fn test_plugins_run_in_order_and_see_mutations() {
        let a = Appender::new("a");
        let b = Appender::new("b");
        let mut pipeline = PluginPipeline::new();
        pipeline.register(a.clone());
        pipeline.register(b.clone());

        let mut event = event();
        let failures = pipeline.process(&mut event).await;

        assert_eq!(failures, 0);
        assert_eq!(event.text, "ab");
        assert_eq!(*b.seen.lock().unwrap(), vec!["a"]);
        assert_eq!(pipeline.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failing_plugin_does_not_stop_the_rest() {
        let after = Appender::new("after");
        let mut pipeline = PluginPipeline::new();
        pipeline.register(Arc::new(Failing));
        pipeline.register(Arc::new(Panicking));
        pipeline.register(after.clone());

        let mut event = event();
        let failures = pipeline.process(&mut event).await;

        assert_eq!(failures, 2);
        assert_eq!(after.seen.lock().unwrap().len(), 1);
        assert_eq!(event.text, "after");
    }

    #[tokio::test]
    async fn test_init_runs_once_and_failure_keeps_plugin() {
        let plugin = Arc::new(CountingInit {
            inits: AtomicUsize::new(0),
            fail: true,
        });
        let mut pipeline = PluginPipeline::new();
        pipeline.register(plugin.clone()).await.unwrap();

        let mut event = event();
        pipeline.process(&mut event).await;
        pipeline.process(&mut event).await;

        assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.count(), 1);
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
