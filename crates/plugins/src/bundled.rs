//! Plugins shipped with parley and enabled from `[plugins]` config.

pub mod auto_reply;
pub mod command_logger;

use std::sync::Arc;

use parley_config::PluginsConfig;

use crate::plugin::Plugin;

pub use {auto_reply::AutoReplyPlugin, command_logger::CommandLoggerPlugin};

/// Bundled plugins enabled by `config`, in load order.
pub fn from_config(config: &PluginsConfig) -> Vec<Arc<dyn Plugin>> {
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
    if config.auto_reply.enabled {
        plugins.push(Arc::new(AutoReplyPlugin::new(config.auto_reply.rules.clone())));
    }
    if config.command_logger.enabled {
        let path = config
            .command_logger
            .path
            .clone()
            .unwrap_or_else(CommandLoggerPlugin::default_path);
        plugins.push(Arc::new(CommandLoggerPlugin::new(path)));
    }
    plugins
}
