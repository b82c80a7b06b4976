//! Domain types shared by the spaced crates.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Paths crossing a crate boundary are absolute and lexically normalized
//! (see [`normalize_path`]).

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque token identifying one revision of an entry's content.
///
/// Two lookups returning the same `ContentId` saw the same content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId(pub String);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What kind of filesystem node an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Directory => write!(f, "directory"),
            EntryKind::Symlink => write!(f, "symlink"),
        }
    }
}

/// Running state of the supervised node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Stopped,
    Starting,
    Running,
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Starting => write!(f, "starting"),
            NodeState::Running => write!(f, "running"),
            NodeState::Failed => write!(f, "failed"),
        }
    }
}

/// Discriminant of a [`WatchEvent`], handy for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEventKind::Created => write!(f, "created"),
            WatchEventKind::Modified => write!(f, "modified"),
            WatchEventKind::Deleted => write!(f, "deleted"),
            WatchEventKind::Renamed => write!(f, "renamed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// Snapshot of one filesystem node at lookup time.
///
/// Never mutated after it is handed out; a new lookup yields a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Absolute, normalized path.
    pub path: PathBuf,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub content_id: ContentId,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A normalized filesystem change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl WatchEvent {
    pub fn kind(&self) -> WatchEventKind {
        match self {
            WatchEvent::Created(_) => WatchEventKind::Created,
            WatchEvent::Modified(_) => WatchEventKind::Modified,
            WatchEvent::Deleted(_) => WatchEventKind::Deleted,
            WatchEvent::Renamed { .. } => WatchEventKind::Renamed,
        }
    }

    /// The path the event is about; for a rename, the new path.
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
            WatchEvent::Renamed { to, .. } => to,
        }
    }

    /// The old path of a rename.
    pub fn previous_path(&self) -> Option<&Path> {
        match self {
            WatchEvent::Renamed { from, .. } => Some(from),
            _ => None,
        }
    }
}

/// Health snapshot of the node process, published on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeHealth {
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the node reached `Failed`; kept until the next start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Lexically normalize an absolute path: drops `.` components and resolves `..`
/// against the preceding component. Returns `None` for relative paths.
///
/// No filesystem access; symlinks are not resolved.
pub fn normalize_path(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Final path component as a `String`, or the whole path for a root.
pub fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
