//! Error types for spaced-cache.

use std::path::PathBuf;
use std::sync::Arc;

use spaced_core::permissions::Access;
use spaced_core::types::NodeState;
use spaced_core::Interrupted;
use thiserror::Error;

/// Errors reported by a [`crate::backend::NodeBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no such entry: {path}")]
    NotFound { path: PathBuf },

    #[error("entry already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("is a directory: {path}")]
    IsADirectory { path: PathBuf },

    #[error("storage root cannot be modified: {path}")]
    RootEntry { path: PathBuf },

    #[error("cannot create {kind} entries: {path}")]
    Unsupported { path: PathBuf, kind: &'static str },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Classify an I/O failure, keeping the variants callers branch on.
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> BackendError {
    let path = path.into();
    match source.kind() {
        std::io::ErrorKind::NotFound => BackendError::NotFound { path },
        std::io::ErrorKind::AlreadyExists => BackendError::AlreadyExists { path },
        _ => BackendError::Io { path, source },
    }
}

/// Everything a [`crate::DataSource`] call can fail with.
///
/// `Clone` so one backend result can be handed to every caller sharing a fetch.
#[derive(Debug, Clone, Error)]
pub enum DataSourceError {
    #[error("no such entry: {path}")]
    NotFound { path: PathBuf },

    #[error("{access} access denied: {path}")]
    PermissionDenied { path: PathBuf, access: Access },

    #[error("storage node unavailable (state: {state})")]
    BackendUnavailable { state: NodeState },

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("path must be absolute: {path}")]
    InvalidPath { path: PathBuf },

    #[error("entry already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("is a directory: {path}")]
    IsADirectory { path: PathBuf },

    #[error("stream is closed")]
    StreamClosed,

    #[error("stream was opened read-only")]
    ReadOnlyStream,

    #[error("backend error: {0}")]
    Backend(Arc<BackendError>),
}

impl From<BackendError> for DataSourceError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound { path } => DataSourceError::NotFound { path },
            BackendError::AlreadyExists { path } => DataSourceError::AlreadyExists { path },
            BackendError::NotADirectory { path } => DataSourceError::NotADirectory { path },
            BackendError::IsADirectory { path } => DataSourceError::IsADirectory { path },
            other => DataSourceError::Backend(Arc::new(other)),
        }
    }
}

impl From<Interrupted> for DataSourceError {
    fn from(err: Interrupted) -> Self {
        match err {
            Interrupted::Canceled => DataSourceError::Canceled,
            Interrupted::DeadlineExceeded => DataSourceError::DeadlineExceeded,
        }
    }
}
