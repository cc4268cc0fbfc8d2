//! Configuration loading, validation and environment overrides.
//!
//! Config files: `parley.toml`, `parley.yaml`, or `parley.json`
//! Searched in `./` then the user config directory.
//!
//! Supports `${ENV_VAR}` substitution in the raw file and `PARLEY_*`
//! overrides for every tunable.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        apply_env_overrides, apply_env_overrides_with, clear_data_dir, config_dir, data_dir,
        database_url, discover_and_load, find_config_file, load_config, set_config_dir,
        set_data_dir,
    },
    schema::{
        AutoReplyConfig, AutoReplyRule, CommandLoggerConfig, CommandsConfig, ParleyConfig,
        PluginsConfig, RateLimitConfig, ServerConfig, SessionConfig, StoreConfig, WebhookConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
