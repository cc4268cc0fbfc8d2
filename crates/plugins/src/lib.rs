//! Plugin contract, lifecycle host and bundled plugins.
//!
//! Plugins are an explicit list handed to [`PluginHost::load_all`] at
//! startup. A plugin may register commands and contribute one pipeline
//! middleware; both are removed again when it unloads.

pub mod bundled;
pub mod host;
pub mod plugin;

pub use {
    host::{PluginHost, PluginInfo},
    plugin::{Plugin, PluginContext},
};
