use thiserror::Error;

/// Errors shared by every parley crate.
///
/// Rate limiting is deliberately absent: an exhausted window is reported
/// through `RateDecision::allowed`, never as an error.
#[derive(Error, Debug)]
pub enum Error {
    /// A registration or configuration value was rejected.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// A command, plugin or record does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A webhook signature or timestamp did not check out.
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    /// A plugin failed to initialize or tear down.
    #[error("plugin {plugin} failed during {phase}: {message}")]
    PluginLifecycle {
        plugin: String,
        phase: &'static str,
        message: String,
    },

    /// The session gave up reconnecting.
    #[error("reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A send was attempted while the session was not connected.
    #[error("session is not connected (state: {state})")]
    NotConnected { state: String },

    /// The chat-network transport reported a failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A persistence backend failed.
    #[error("store error: {source}")]
    Store {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn plugin_lifecycle(
        plugin: impl Into<String>,
        phase: &'static str,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::PluginLifecycle {
            plugin: plugin.into(),
            phase,
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn not_connected(state: impl std::fmt::Display) -> Self {
        Self::NotConnected {
            state: state.to_string(),
        }
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn store(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store {
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type ParleyError = Error;
pub type Result<T> = std::result::Result<T, Error>;

// ── Shared context trait ────────────────────────────────────────────────────

/// Trait for error types that can be constructed from a plain message string.
///
/// Implement this for your crate's error type, then invoke [`impl_context!`]
/// in your error module to get `.context()` and `.with_context()` on `Result`
/// and `Option`.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generate a crate-local `Context` trait with `.context()` and `.with_context()`
/// methods on `Result` and `Option`.
///
/// Invoke inside a module that defines `Error: FromMessage` and
/// `type Result<T> = std::result::Result<T, Error>`.
///
/// ```ignore
/// // in crates/foo/src/error.rs
/// parley_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

impl_context!();

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_result_errors() {
        let res: std::result::Result<(), std::num::ParseIntError> =
            "x".parse::<u32>().map(|_| ());
        let err = res.context("parsing port").unwrap_err();
        assert!(err.to_string().starts_with("parsing port: "));
    }

    #[test]
    fn context_on_none() {
        let err = None::<u8>.context("missing field").unwrap_err();
        assert!(matches!(err, Error::Message(m) if m == "missing field"));
    }

    #[test]
    fn not_found_names_kind() {
        let err = Error::not_found("command", "ping");
        assert_eq!(err.to_string(), "command not found: ping");
    }
}
