//! Path filters deciding which filesystem entries the rest of the daemon sees.
//!
//! Filters are pure: the caller supplies [`EntryAttributes`] (usually built
//! from metadata it already read) so a filter never touches the disk.
//! Platform differences live in separate implementations composed behind the
//! same trait; [`platform_filter`] picks the composition for the build target.

use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;

use crate::types::EntryKind;

/// Names the OS or file managers drop into user folders.
pub const SYSTEM_ENTRY_NAMES: &[&str] = &[
    ".DS_Store",
    ".Trashes",
    ".localized",
    ".fseventsd",
    ".ql_disablethumbnails",
    ".ql_disablecache",
    ".keep",
    "Thumbs.db",
    "desktop.ini",
];

/// What a filter may inspect about an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAttributes {
    pub name: String,
    /// `None` when the entry no longer exists (e.g. a delete notification).
    pub kind: Option<EntryKind>,
    /// Platform hidden attribute (`FILE_ATTRIBUTE_HIDDEN` on Windows).
    pub hidden: bool,
}

impl EntryAttributes {
    /// Attributes known from the name alone.
    pub fn from_name(path: &Path) -> Self {
        Self {
            name: crate::types::entry_name(path),
            kind: None,
            hidden: false,
        }
    }

    /// Attributes from `symlink_metadata` output the caller already holds.
    pub fn from_metadata(path: &Path, meta: &Metadata) -> Self {
        let ty = meta.file_type();
        let kind = if ty.is_symlink() {
            EntryKind::Symlink
        } else if ty.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Self {
            name: crate::types::entry_name(path),
            kind: Some(kind),
            hidden: hidden_attribute(meta),
        }
    }
}

#[cfg(windows)]
fn hidden_attribute(meta: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    meta.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn hidden_attribute(_meta: &Metadata) -> bool {
    false
}

/// Decides whether an entry is invisible to the rest of the daemon.
pub trait PathFilter: Send + Sync {
    fn is_excluded(&self, path: &Path, attrs: &EntryAttributes) -> bool;
}

/// Unix convention: a leading dot hides the entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotfileFilter;

impl PathFilter for DotfileFilter {
    fn is_excluded(&self, _path: &Path, attrs: &EntryAttributes) -> bool {
        attrs.name.starts_with('.')
    }
}

/// OS housekeeping files listed in [`SYSTEM_ENTRY_NAMES`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEntryFilter;

impl PathFilter for SystemEntryFilter {
    fn is_excluded(&self, _path: &Path, attrs: &EntryAttributes) -> bool {
        SYSTEM_ENTRY_NAMES.contains(&attrs.name.as_str())
    }
}

/// Platform hidden attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct HiddenAttributeFilter;

impl PathFilter for HiddenAttributeFilter {
    fn is_excluded(&self, _path: &Path, attrs: &EntryAttributes) -> bool {
        attrs.hidden
    }
}

/// Excludes an entry when any member filter does.
#[derive(Clone, Default)]
pub struct AnyFilter {
    filters: Vec<Arc<dyn PathFilter>>,
}

impl AnyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl PathFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }
}

impl PathFilter for AnyFilter {
    fn is_excluded(&self, path: &Path, attrs: &EntryAttributes) -> bool {
        self.filters.iter().any(|f| f.is_excluded(path, attrs))
    }
}

/// Default filter for the build target.
pub fn platform_filter() -> Arc<dyn PathFilter> {
    let filter = AnyFilter::new().with(SystemEntryFilter);
    let filter = if cfg!(windows) {
        filter.with(HiddenAttributeFilter)
    } else {
        filter.with(DotfileFilter)
    };
    Arc::new(filter)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
