use std::path::PathBuf;

use thiserror::Error;

/// Failures of the node process supervisor.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to spawn node binary {binary}: {source}")]
    SpawnFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("node process exited unexpectedly ({status})")]
    ExitedUnexpectedly { status: String },

    #[error("node did not become ready within {timeout_ms} ms")]
    ReadyTimeout { timeout_ms: u64 },

    #[error("node supervisor was already started")]
    AlreadyStarted,

    #[error("node process did not stop within {timeout_ms} ms")]
    StopTimeout { timeout_ms: u64 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the file watcher. `Overflow` is also delivered in-stream.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch buffer overflowed; {dropped} notifications dropped")]
    Overflow { dropped: u64 },

    #[error("file watcher is already running")]
    AlreadyRunning,

    #[error("cannot watch root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// Error surface for the daemon runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] spaced_core::ConfigError),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("cache error: {0}")]
    Cache(#[from] spaced_cache::DataSourceError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("daemon is not running")]
    NotRunning,

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("{task} task failed: {reason}")]
    Task { task: &'static str, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
