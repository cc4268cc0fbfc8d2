use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::RwLock,
};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::ParleyConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["parley.toml", "parley.yaml", "parley.yml", "parley.json"];

static DATA_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);
static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<ParleyConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply `PARLEY_*`
/// environment overrides.
///
/// Search order:
/// 1. `./parley.{toml,yaml,yml,json}` (project-local)
/// 2. `<config_dir>/parley.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `ParleyConfig::default()` if no file is found or the file
/// fails to parse.
pub fn discover_and_load() -> ParleyConfig {
    let mut cfg = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            match load_config(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    ParleyConfig::default()
                },
            }
        },
        None => {
            debug!("no config file found, using defaults");
            ParleyConfig::default()
        },
    };
    apply_env_overrides(&mut cfg);
    cfg
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// User-global config directory (`~/.config/parley/` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = read_override(&CONFIG_DIR_OVERRIDE) {
        return Some(dir);
    }
    directories::ProjectDirs::from("", "", "parley").map(|d| d.config_dir().to_path_buf())
}

/// Directory for the database and plugin output.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = read_override(&DATA_DIR_OVERRIDE) {
        return dir;
    }
    directories::ProjectDirs::from("", "", "parley")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".parley"))
}

pub fn set_config_dir(dir: PathBuf) {
    write_override(&CONFIG_DIR_OVERRIDE, Some(dir));
}

pub fn set_data_dir(dir: PathBuf) {
    write_override(&DATA_DIR_OVERRIDE, Some(dir));
}

pub fn clear_data_dir() {
    write_override(&DATA_DIR_OVERRIDE, None);
}

fn read_override(slot: &RwLock<Option<PathBuf>>) -> Option<PathBuf> {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn write_override(slot: &RwLock<Option<PathBuf>>, value: Option<PathBuf>) {
    *slot.write().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Resolve the SQLite URL, defaulting into [`data_dir`].
pub fn database_url(cfg: &ParleyConfig) -> String {
    cfg.store.database_url.clone().unwrap_or_else(|| {
        format!(
            "sqlite://{}?mode=rwc",
            data_dir().join("parley.db").display()
        )
    })
}

fn parse_config(raw: &str, path: &Path) -> Result<ParleyConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

/// Apply `PARLEY_*` environment variables on top of a loaded config.
pub fn apply_env_overrides(cfg: &mut ParleyConfig) {
    apply_env_overrides_with(cfg, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with a custom lookup.
///
/// Values that fail to parse are logged and ignored.
pub fn apply_env_overrides_with(cfg: &mut ParleyConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn set<T: FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        var: &str,
        target: &mut T,
    ) {
        let Some(raw) = lookup(var) else {
            return;
        };
        match raw.trim().parse::<T>() {
            Ok(value) => {
                debug!(var, "config override from environment");
                *target = value;
            },
            Err(_) => warn!(var, value = %raw, "ignoring unparseable environment override"),
        }
    }

    set(&lookup, "PARLEY_BIND", &mut cfg.server.bind);
    set(&lookup, "PARLEY_PORT", &mut cfg.server.port);

    let s = &mut cfg.session;
    set(&lookup, "PARLEY_SIDECAR_URL", &mut s.sidecar_url);
    set(&lookup, "PARLEY_RECONNECT_BASE_DELAY_MS", &mut s.reconnect_base_delay_ms);
    set(&lookup, "PARLEY_RECONNECT_MAX_DELAY_MS", &mut s.reconnect_max_delay_ms);
    set(&lookup, "PARLEY_MAX_RECONNECT_ATTEMPTS", &mut s.max_reconnect_attempts);
    set(&lookup, "PARLEY_QR_REFRESH_INTERVAL_MS", &mut s.qr_refresh_interval_ms);
    set(&lookup, "PARLEY_HEALTH_CHECK_INTERVAL_MS", &mut s.health_check_interval_ms);
    set(&lookup, "PARLEY_HEALTH_CHECK_TIMEOUT_MS", &mut s.health_check_timeout_ms);
    set(&lookup, "PARLEY_SIDECAR_REQUEST_TIMEOUT_MS", &mut s.request_timeout_ms);

    set(&lookup, "PARLEY_COMMAND_PREFIX", &mut cfg.commands.prefix);
    set(&lookup, "PARLEY_RESPOND_TO_SELF", &mut cfg.commands.respond_to_self);

    let r = &mut cfg.rate_limit;
    set(&lookup, "PARLEY_RATE_LIMIT_WINDOW_MS", &mut r.window_ms);
    set(&lookup, "PARLEY_RATE_LIMIT_MAX_REQUESTS", &mut r.max_requests);
    set(&lookup, "PARLEY_RATE_LIMIT_SWEEP_INTERVAL_MS", &mut r.sweep_interval_ms);

    let w = &mut cfg.webhook;
    if let Some(secret) = lookup("PARLEY_WEBHOOK_SECRET") {
        w.secret = Secret::new(secret);
    }
    set(&lookup, "PARLEY_WEBHOOK_TIMEOUT_MS", &mut w.timeout_ms);
    set(&lookup, "PARLEY_WEBHOOK_REQUIRE_TIMESTAMP", &mut w.require_timestamp);
    set(&lookup, "PARLEY_WEBHOOK_ENVELOPE_TTL_MS", &mut w.envelope_ttl_ms);

    if let Some(url) = lookup("PARLEY_DATABASE_URL") {
        cfg.store.database_url = Some(url);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.yaml");
        std::fs::write(
            &path,
            "rate_limit:\n  window_ms: 1000\n  max_requests: 3\nserver:\n  port: 8080\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.rate_limit.window_ms, 1000);
        assert_eq!(cfg.rate_limit.max_requests, 3);
        assert_eq!(cfg.server.port, 8080);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/parley.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/parley.toml"));
    }

    #[test]
    fn env_overrides_apply_and_skip_garbage() {
        let mut cfg = ParleyConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "PARLEY_MAX_RECONNECT_ATTEMPTS" => Some("3".into()),
            "PARLEY_COMMAND_PREFIX" => Some("/".into()),
            "PARLEY_RATE_LIMIT_WINDOW_MS" => Some("soon".into()),
            "PARLEY_WEBHOOK_SECRET" => Some("abc".into()),
            _ => None,
        });
        assert_eq!(cfg.session.max_reconnect_attempts, 3);
        assert_eq!(cfg.commands.prefix, '/');
        assert_eq!(cfg.rate_limit.window_ms, 60_000);
        assert_eq!(cfg.webhook.secret.expose_secret(), "abc");
    }

    #[test]
    fn explicit_database_url_wins() {
        let mut cfg = ParleyConfig::default();
        cfg.store.database_url = Some("sqlite::memory:".into());
        assert_eq!(database_url(&cfg), "sqlite::memory:");
    }
}
