use std::sync::{Arc, Mutex};

use {
    async_trait::async_trait,
    parley_commands::{Command, Dispatcher},
    parley_common::{Outbound, Result},
    parley_pipeline::Middleware,
};

/// A unit of optional behaviour loaded at startup.
///
/// `init` may register commands through the [`PluginContext`]; the host
/// remembers them and removes them again on unload, together with the
/// plugin's middleware.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    async fn init(&self, ctx: &PluginContext) -> anyhow::Result<()>;

    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Appended to the pipeline after a successful `init`.
    fn middleware(&self) -> Option<Arc<dyn Middleware>> {
        None
    }
}

/// Capabilities handed to [`Plugin::init`].
pub struct PluginContext {
    plugin: String,
    dispatcher: Arc<Dispatcher>,
    outbound: Arc<dyn Outbound>,
    registered: Mutex<Vec<String>>,
}

impl PluginContext {
    pub(crate) fn new(plugin: &str, dispatcher: Arc<Dispatcher>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            plugin: plugin.to_string(),
            dispatcher,
            outbound,
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn outbound(&self) -> Arc<dyn Outbound> {
        Arc::clone(&self.outbound)
    }

    pub fn command_prefix(&self) -> char {
        self.dispatcher.prefix()
    }

    /// Register a command owned by this plugin.
    pub fn register_command(&self, command: Command) -> Result<()> {
        let name = command.name.trim().to_lowercase();
        self.dispatcher.register(command)?;
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name);
        Ok(())
    }

    pub(crate) fn take_registered(&self) -> Vec<String> {
        std::mem::take(&mut *self.registered.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
