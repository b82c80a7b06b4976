//! Runtime file layout under `~/.spaced/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use spaced_core::config::spaced_dir_at;

pub const PID_FILE: &str = "spaced.pid";
pub const STATUS_FILE: &str = "status.json";
pub const NODE_STDOUT_LOG: &str = "node.log";
pub const NODE_STDERR_LOG: &str = "node-err.log";

/// How often node logs are checked for rotation.
pub const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

/// Status snapshot refresh when nothing else changed.
pub const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub fn run_dir(home: &Path) -> PathBuf {
    spaced_dir_at(home).join("run")
}

pub fn pid_path(home: &Path) -> PathBuf {
    run_dir(home).join(PID_FILE)
}

pub fn status_path(home: &Path) -> PathBuf {
    run_dir(home).join(STATUS_FILE)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    spaced_dir_at(home).join("logs")
}

pub fn node_stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(NODE_STDOUT_LOG)
}

pub fn node_stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(NODE_STDERR_LOG)
}
