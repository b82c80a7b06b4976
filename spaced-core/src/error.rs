//! Error types for spaced-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading, saving or validating the daemon config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (permission denied, read-only filesystem, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, including file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.spaced/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// A field holds a value the daemon cannot run with.
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Outcome of waiting on a [`crate::lifecycle::ReadinessGate`] that did not open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The owning component stopped or failed before it ever became ready.
    #[error("component closed before becoming ready")]
    Closed,

    /// The waiter's cancellation token fired first.
    #[error("wait for readiness canceled")]
    Canceled,
}

/// Errors raised by a [`crate::secrets::SecretStore`] implementation.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found: {key}")]
    NotFound { key: String },

    #[error("secret store backend error: {0}")]
    Backend(String),
}

/// Errors raised while authenticating an access token.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access token is malformed")]
    MalformedToken,

    #[error("app token is invalid")]
    InvalidToken,

    #[error("a master app token already exists")]
    MasterTokenExists,

    #[error("unknown permission grant '{0}'")]
    UnknownGrant(String),

    #[error("secret store error: {0}")]
    Store(#[from] SecretStoreError),

    #[error("token JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a [`crate::context::RequestContext`] stopped an operation early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}
