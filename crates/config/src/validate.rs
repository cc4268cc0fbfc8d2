//! Semantic validation of a loaded configuration.
//!
//! Parsing already guarantees types; this catches values that parse fine
//! but cannot work together (a zero window, a base delay above its cap, a
//! broadcast list without a signing secret).

use crate::schema::ParleyConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "rate_limit.window_ms"
    pub path: &'static str,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.path, self.message)
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path,
            message: message.into(),
        });
    }
}

/// Check a configuration for values that would break the runtime.
#[must_use]
pub fn validate(cfg: &ParleyConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    let s = &cfg.session;
    if s.reconnect_base_delay_ms == 0 {
        result.push(
            Severity::Error,
            "session.reconnect_base_delay_ms",
            "must be greater than zero",
        );
    }
    if s.reconnect_base_delay_ms > s.reconnect_max_delay_ms {
        result.push(
            Severity::Error,
            "session.reconnect_base_delay_ms",
            format!(
                "base delay {}ms exceeds reconnect_max_delay_ms {}ms",
                s.reconnect_base_delay_ms, s.reconnect_max_delay_ms
            ),
        );
    }
    if s.qr_refresh_interval_ms == 0 {
        result.push(
            Severity::Error,
            "session.qr_refresh_interval_ms",
            "must be greater than zero",
        );
    }
    if s.health_check_interval_ms == 0 {
        result.push(
            Severity::Error,
            "session.health_check_interval_ms",
            "must be greater than zero",
        );
    }
    if s.health_check_timeout_ms >= s.health_check_interval_ms {
        result.push(
            Severity::Warning,
            "session.health_check_timeout_ms",
            "probe timeout is not shorter than the probe interval",
        );
    }
    if s.max_reconnect_attempts == 0 {
        result.push(
            Severity::Warning,
            "session.max_reconnect_attempts",
            "0 means the first disconnect is fatal",
        );
    }

    if cfg.commands.prefix.is_whitespace() || cfg.commands.prefix.is_alphanumeric() {
        result.push(
            Severity::Error,
            "commands.prefix",
            format!(
                "{:?} cannot mark commands; use a symbol such as '!' or '/'",
                cfg.commands.prefix
            ),
        );
    }

    let r = &cfg.rate_limit;
    if r.window_ms == 0 {
        result.push(Severity::Error, "rate_limit.window_ms", "must be greater than zero");
    }
    if r.max_requests == 0 {
        result.push(
            Severity::Warning,
            "rate_limit.max_requests",
            "0 disables per-conversation rate limiting",
        );
    }
    if r.sweep_interval_ms == 0 {
        result.push(
            Severity::Error,
            "rate_limit.sweep_interval_ms",
            "must be greater than zero",
        );
    }

    let w = &cfg.webhook;
    if !w.is_enabled() && !w.subscribers.is_empty() {
        result.push(
            Severity::Error,
            "webhook.subscribers",
            "broadcast subscribers need webhook.secret to sign envelopes",
        );
    }
    if w.is_enabled() && w.timeout_ms == 0 {
        result.push(
            Severity::Error,
            "webhook.timeout_ms",
            "a zero tolerance rejects every timestamped request",
        );
    }
    if w.subscribers
        .iter()
        .any(|u| !(u.starts_with("http://") || u.starts_with("https://")))
    {
        result.push(
            Severity::Error,
            "webhook.subscribers",
            "subscriber URLs must be http(s)",
        );
    }

    for rule in &cfg.plugins.auto_reply.rules {
        if rule.keyword.trim().is_empty() {
            result.push(
                Severity::Warning,
                "plugins.auto_reply.rules",
                "rule with an empty keyword matches every message",
            );
        }
    }

    result
}
