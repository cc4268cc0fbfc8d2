use std::path::Path;

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    parley_config::{ParleyConfig, Severity},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration and report errors and warnings.
    Check,
    /// Print the effective configuration (file, then environment overrides).
    Show,
}

/// Load `path` if given, otherwise search the standard locations. Environment
/// overrides apply either way.
pub fn load(path: Option<&Path>) -> Result<ParleyConfig> {
    match path {
        Some(path) => {
            let mut cfg = parley_config::load_config(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            parley_config::apply_env_overrides(&mut cfg);
            Ok(cfg)
        },
        None => Ok(parley_config::discover_and_load()),
    }
}

pub fn handle_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check => check(path),
        ConfigAction::Show => {
            let cfg = load(path)?;
            println!("{}", toml::to_string_pretty(&redacted(&cfg)?)?);
            Ok(())
        },
    }
}

fn redacted(cfg: &ParleyConfig) -> Result<toml::Value> {
    let mut value = toml::Value::try_from(cfg)?;
    if cfg.webhook.is_enabled()
        && let Some(webhook) = value.get_mut("webhook").and_then(toml::Value::as_table_mut)
    {
        webhook.insert("secret".into(), toml::Value::String("[REDACTED]".into()));
    }
    Ok(value)
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(path: Option<&Path>) -> Result<()> {
    match path
        .map(Path::to_path_buf)
        .or_else(parley_config::find_config_file)
    {
        Some(p) => eprintln!("Checking {}\n", p.display()),
        None => eprintln!("No config file found; checking defaults.\n"),
    }

    let cfg = load(path)?;
    let result = parley_config::validate(&cfg);
    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if !result.diagnostics.is_empty() {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
