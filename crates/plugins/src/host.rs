use std::{panic::AssertUnwindSafe, sync::Arc};

use {
    futures::FutureExt,
    parley_commands::Dispatcher,
    parley_common::{Error, Outbound, Result},
    parley_pipeline::Pipeline,
    serde::Serialize,
    tokio::sync::Mutex,
    tracing::{info, warn},
};

use crate::plugin::{Plugin, PluginContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub commands: Vec<String>,
    pub middleware: Option<String>,
}

struct Loaded {
    plugin: Arc<dyn Plugin>,
    commands: Vec<String>,
    middleware: Option<String>,
}

/// Owns loaded plugins and keeps one plugin's failure from affecting others.
pub struct PluginHost {
    dispatcher: Arc<Dispatcher>,
    pipeline: Arc<Pipeline>,
    outbound: Arc<dyn Outbound>,
    loaded: Mutex<Vec<Loaded>>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

impl PluginHost {
    pub fn new(dispatcher: Arc<Dispatcher>, pipeline: Arc<Pipeline>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            dispatcher,
            pipeline,
            outbound,
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Initialize a plugin and attach its commands and middleware.
    ///
    /// On failure everything the plugin registered is rolled back and a
    /// `PluginLifecycle` error is returned; other plugins are untouched.
    pub async fn load(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let mut loaded = self.loaded.lock().await;
        let name = plugin.name().to_string();
        if loaded.iter().any(|l| l.plugin.name() == name) {
            return Err(Error::validation(format!("plugin {name} is already loaded")));
        }

        let ctx = PluginContext::new(&name, Arc::clone(&self.dispatcher), Arc::clone(&self.outbound));
        let outcome = AssertUnwindSafe(plugin.init(&ctx)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        let commands = ctx.take_registered();

        if let Some(message) = failure {
            self.detach_commands(&name, &commands);
            return Err(Error::plugin_lifecycle(name, "init", message));
        }

        let middleware = match plugin.middleware() {
            Some(mw) => {
                let mw_name = mw.name().to_string();
                if let Err(e) = self.pipeline.use_middleware(mw) {
                    self.detach_commands(&name, &commands);
                    return Err(Error::plugin_lifecycle(name, "init", e));
                }
                Some(mw_name)
            },
            None => None,
        };

        info!(plugin = %name, version = plugin.version(), commands = commands.len(), "plugin loaded");
        loaded.push(Loaded {
            plugin,
            commands,
            middleware,
        });
        Ok(())
    }

    /// Load each plugin in order, logging and skipping failures. Returns the
    /// number loaded.
    pub async fn load_all(&self, plugins: Vec<Arc<dyn Plugin>>) -> usize {
        let mut ok = 0;
        for plugin in plugins {
            match self.load(plugin).await {
                Ok(()) => ok += 1,
                Err(e) => warn!(error = %e, "plugin skipped"),
            }
        }
        ok
    }

    /// Detach and destroy a plugin. Its commands and middleware are removed
    /// even when `destroy` fails; that failure is still reported.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let entry = {
            let mut loaded = self.loaded.lock().await;
            let Some(pos) = loaded.iter().position(|l| l.plugin.name() == name) else {
                return Err(Error::not_found("plugin", name));
            };
            loaded.remove(pos)
        };
        self.teardown(entry).await
    }

    /// Unload every plugin in reverse load order, logging failures.
    pub async fn shutdown(&self) {
        let entries: Vec<Loaded> = std::mem::take(&mut *self.loaded.lock().await);
        for entry in entries.into_iter().rev() {
            if let Err(e) = self.teardown(entry).await {
                warn!(error = %e, "plugin teardown failed");
            }
        }
    }

    async fn teardown(&self, entry: Loaded) -> Result<()> {
        let name = entry.plugin.name().to_string();
        if let Some(mw) = &entry.middleware {
            self.pipeline.remove(mw);
        }
        self.detach_commands(&name, &entry.commands);

        let outcome = AssertUnwindSafe(entry.plugin.destroy()).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        match failure {
            Some(message) => Err(Error::plugin_lifecycle(name, "destroy", message)),
            None => {
                info!(plugin = %name, "plugin unloaded");
                Ok(())
            },
        }
    }

    fn detach_commands(&self, plugin: &str, commands: &[String]) {
        for command in commands {
            if let Err(e) = self.dispatcher.unregister(command) {
                warn!(plugin, command = %command, error = %e, "failed to unregister plugin command");
            }
        }
    }

    pub async fn names(&self) -> Vec<String> {
        self.loaded
            .lock()
            .await
            .iter()
            .map(|l| l.plugin.name().to_string())
            .collect()
    }

    pub async fn list(&self) -> Vec<PluginInfo> {
        self.loaded
            .lock()
            .await
            .iter()
            .map(|l| PluginInfo {
                name: l.plugin.name().to_string(),
                version: l.plugin.version().to_string(),
                commands: l.commands.clone(),
                middleware: l.middleware.clone(),
            })
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        parley_commands::Command,
        parley_common::{DeliveryReceipt, InboundEvent},
        parley_config::CommandsConfig,
        parley_pipeline::{MessageContext, Middleware, Next},
        std::sync::atomic::{AtomicBool, Ordering},
    };

    struct NullOutbound;

    #[async_trait]
    impl Outbound for NullOutbound {
        async fn send_text(&self, conversation_id: &str, _text: &str) -> Result<DeliveryReceipt> {
            Ok(DeliveryReceipt {
                message_id: "x".into(),
                conversation_id: conversation_id.into(),
                sent_at_ms: 0,
            })
        }
    }

    struct Marker;

    #[async_trait]
    impl Middleware for Marker {
        fn name(&self) -> &str {
            "marker"
        }

        async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
            ctx.handled = true;
            next.run(ctx).await
        }
    }

    enum Mode {
        Ok,
        FailInit,
        PanicInit,
        FailDestroy,
    }

    struct TestPlugin {
        name: &'static str,
        mode: Mode,
        destroyed: Arc<AtomicBool>,
    }

    impl TestPlugin {
        fn new(name: &'static str, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                name,
                mode,
                destroyed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        async fn init(&self, ctx: &PluginContext) -> anyhow::Result<()> {
            ctx.register_command(
                Command::new(format!("{}-cmd", self.name)).handler_fn(|_| async { Ok(()) }),
            )?;
            match self.mode {
                Mode::FailInit => anyhow::bail!("init exploded"),
                Mode::PanicInit => panic!("init panicked"),
                _ => Ok(()),
            }
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            if matches!(self.mode, Mode::FailDestroy) {
                anyhow::bail!("destroy exploded");
            }
            Ok(())
        }

        fn middleware(&self) -> Option<Arc<dyn Middleware>> {
            (self.name == "with-mw").then(|| Arc::new(Marker) as Arc<dyn Middleware>)
        }
    }

    fn host() -> (PluginHost, Arc<Dispatcher>, Arc<Pipeline>) {
        let outbound: Arc<dyn Outbound> = Arc::new(NullOutbound);
        let dispatcher = Arc::new(Dispatcher::new(
            &CommandsConfig::default(),
            Arc::clone(&outbound),
        ));
        let pipeline = Arc::new(Pipeline::new());
        (
            PluginHost::new(Arc::clone(&dispatcher), Arc::clone(&pipeline), outbound),
            dispatcher,
            pipeline,
        )
    }

    #[tokio::test]
    async fn load_registers_commands_and_middleware() {
        let (host, dispatcher, pipeline) = host();
        host.load(TestPlugin::new("with-mw", Mode::Ok)).await.unwrap();

        assert!(dispatcher.resolve("with-mw-cmd").is_some());
        assert_eq!(pipeline.names(), vec!["marker"]);
        let info = host.list().await;
        assert_eq!(info[0].commands, vec!["with-mw-cmd"]);
        assert_eq!(info[0].middleware.as_deref(), Some("marker"));

        let mut ctx = MessageContext::new(
            Arc::new(InboundEvent::text("c", "s", "hi")),
            Arc::new(NullOutbound),
            '!',
        );
        pipeline.run(&mut ctx).await.unwrap();
        assert!(ctx.handled);
    }

    #[tokio::test]
    async fn failed_init_is_isolated_and_rolled_back() {
        let (host, dispatcher, _) = host();
        let loaded = host
            .load_all(vec![
                TestPlugin::new("bad", Mode::FailInit),
                TestPlugin::new("boom", Mode::PanicInit),
                TestPlugin::new("good", Mode::Ok),
            ])
            .await;
        assert_eq!(loaded, 1);
        assert_eq!(host.names().await, vec!["good"]);
        assert!(dispatcher.resolve("bad-cmd").is_none());
        assert!(dispatcher.resolve("boom-cmd").is_none());
        assert!(dispatcher.resolve("good-cmd").is_some());

        let err = host.load(TestPlugin::new("bad", Mode::FailInit)).await.unwrap_err();
        assert!(matches!(err, Error::PluginLifecycle { phase: "init", .. }));
    }

    #[tokio::test]
    async fn unload_cleans_up_even_when_destroy_fails() {
        let (host, dispatcher, pipeline) = host();
        let plugin = TestPlugin::new("with-mw", Mode::FailDestroy);
        let destroyed = Arc::clone(&plugin.destroyed);
        host.load(plugin).await.unwrap();

        let err = host.unload("with-mw").await.unwrap_err();
        assert!(matches!(err, Error::PluginLifecycle { phase: "destroy", .. }));
        assert!(destroyed.load(Ordering::SeqCst));
        assert!(dispatcher.resolve("with-mw-cmd").is_none());
        assert!(pipeline.names().is_empty());
        assert!(host.names().await.is_empty());

        assert!(matches!(
            host.unload("with-mw").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_plugin_rejected_and_shutdown_destroys_all() {
        let (host, _, _) = host();
        let a = TestPlugin::new("a", Mode::Ok);
        let b = TestPlugin::new("b", Mode::Ok);
        let (da, db) = (Arc::clone(&a.destroyed), Arc::clone(&b.destroyed));
        host.load(a).await.unwrap();
        host.load(b).await.unwrap();
        assert!(host.load(TestPlugin::new("a", Mode::Ok)).await.is_err());

        host.shutdown().await;
        assert!(da.load(Ordering::SeqCst) && db.load(Ordering::SeqCst));
        assert!(host.names().await.is_empty());
    }
}
