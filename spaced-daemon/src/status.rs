//! Pid file and status snapshot shared with the CLI.
//!
//! The daemon owns both files; the CLI only reads them (and signals the pid).

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spaced_core::NodeHealth;

use crate::error::{io_err, DaemonError};
use crate::paths::{pid_path, run_dir, status_path};

/// What `spaced daemon status` shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub node: NodeHealth,
    pub roots: Vec<PathBuf>,
    pub watch_overflows: u64,
    pub cache_entries: usize,
    pub cache_listings: usize,
    /// `false` once the daemon has shut down cleanly.
    pub running: bool,
}

// ---------------------------------------------------------------------------
// Pid file
// ---------------------------------------------------------------------------

pub fn write_pid_at(home: &Path, pid: u32) -> Result<(), DaemonError> {
    write_atomic(&pid_path(home), format!("{pid}\n").as_bytes())
}

/// `None` when there is no pid file or it does not hold a number.
pub fn read_pid_at(home: &Path) -> Result<Option<u32>, DaemonError> {
    let path = pid_path(home);
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

pub fn remove_pid_at(home: &Path) -> Result<(), DaemonError> {
    let path = pid_path(home);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Pid of a live daemon, if any. A stale pid file is ignored.
pub fn running_pid_at(home: &Path) -> Result<Option<u32>, DaemonError> {
    Ok(read_pid_at(home)?.filter(|pid| process_alive(*pid)))
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Ask a running daemon to shut down.
#[cfg(unix)]
pub fn signal_stop(pid: u32) -> Result<(), DaemonError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|err| DaemonError::Signal {
        pid,
        reason: err.to_string(),
    })
}

#[cfg(not(unix))]
pub fn signal_stop(pid: u32) -> Result<(), DaemonError> {
    Err(DaemonError::Signal {
        pid,
        reason: "signals are not supported on this platform".into(),
    })
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

pub fn write_status_at(home: &Path, snapshot: &StatusSnapshot) -> Result<(), DaemonError> {
    let mut json = serde_json::to_vec_pretty(snapshot)?;
    json.push(b'\n');
    write_atomic(&status_path(home), &json)
}

pub fn read_status_at(home: &Path) -> Result<Option<StatusSnapshot>, DaemonError> {
    let path = status_path(home);
    match std::fs::read(&path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DaemonError> {
    let dir = run_dir_of(path);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    file.write_all(contents).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

fn run_dir_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Create `~/.spaced/run` ahead of time.
pub fn ensure_run_dir(home: &Path) -> Result<(), DaemonError> {
    let dir = run_dir(home);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))
}
