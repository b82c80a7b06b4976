//! Authoritative node storage behind the cache.
//!
//! [`NodeBackend`] is what the cache falls back to on a miss and what
//! mutations go through. [`FsBackend`] serves the node's materialized store
//! straight from local disk, confined to a set of roots.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use spaced_core::filter::{EntryAttributes, PathFilter};
use spaced_core::types::{entry_name, normalize_path, ContentId, DirEntry, EntryKind};
use tokio::io::AsyncReadExt;

use crate::error::{io_err, BackendError};
use crate::stream::OpenMode;

const HASH_CHUNK: usize = 64 * 1024;

/// Storage the cache reads through to.
///
/// Paths are absolute and normalized by the caller.
pub trait NodeBackend: Send + Sync + 'static {
    fn stat(&self, path: &Path) -> impl Future<Output = Result<DirEntry, BackendError>> + Send;

    /// Children of a directory, in no particular order.
    fn list(&self, path: &Path)
        -> impl Future<Output = Result<Vec<DirEntry>, BackendError>> + Send;

    fn open(
        &self,
        path: &Path,
        mode: OpenMode,
    ) -> impl Future<Output = Result<tokio::fs::File, BackendError>> + Send;

    fn create(
        &self,
        path: &Path,
        kind: EntryKind,
    ) -> impl Future<Output = Result<DirEntry, BackendError>> + Send;

    fn rename(
        &self,
        from: &Path,
        to: &Path,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Remove an entry; directories are removed with their contents.
    fn remove(&self, path: &Path) -> impl Future<Output = Result<(), BackendError>> + Send;
}

// ---------------------------------------------------------------------------
// FsBackend
// ---------------------------------------------------------------------------

/// Local-disk backend restricted to `roots`. Anything outside is `NotFound`.
#[derive(Clone)]
pub struct FsBackend {
    roots: Vec<PathBuf>,
    filter: Option<Arc<dyn PathFilter>>,
}

impl FsBackend {
    /// Relative roots are ignored.
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .filter_map(|root| normalize_path(&root))
            .collect();
        Self {
            roots,
            filter: None,
        }
    }

    /// Hide entries matching `filter` from directory listings.
    pub fn with_filter(mut self, filter: Arc<dyn PathFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Confine `path` to the roots, following symlinks the way the kernel
    /// will. With `follow_leaf` unset the last component is not followed, so a
    /// link can still be stat'ed, renamed or removed as an entry of its own.
    async fn resolve(&self, path: &Path, follow_leaf: bool) -> Result<PathBuf, BackendError> {
        let not_found = || BackendError::NotFound {
            path: path.to_path_buf(),
        };
        let path = normalize_path(path).ok_or_else(not_found)?;
        if self.roots.iter().any(|root| *root == path) {
            return Ok(path);
        }
        if !self.roots.iter().any(|root| path.starts_with(root)) {
            return Err(not_found());
        }

        let real = real_path(&path, follow_leaf).await;
        for root in &self.roots {
            let real_root = tokio::fs::canonicalize(root)
                .await
                .unwrap_or_else(|_| root.clone());
            if real.starts_with(&real_root) {
                return Ok(path);
            }
        }
        tracing::debug!(path = %path.display(), real = %real.display(), "path escapes roots");
        Err(not_found())
    }

    /// Roots themselves cannot be created, renamed or removed.
    async fn resolve_inner(&self, path: &Path) -> Result<PathBuf, BackendError> {
        let path = self.resolve(path, false).await?;
        if self.roots.iter().any(|root| *root == path) {
            return Err(BackendError::RootEntry { path });
        }
        Ok(path)
    }
}

/// Canonical form of the deepest existing ancestor of `path`, with the
/// missing components appended. Missing components cannot be links.
async fn real_path(path: &Path, follow_leaf: bool) -> PathBuf {
    let (start, leaf) = match (follow_leaf, path.parent()) {
        (false, Some(parent)) => (parent, path.file_name()),
        _ => (path, None),
    };

    let mut missing = Vec::new();
    let mut current = start;
    loop {
        match tokio::fs::canonicalize(current).await {
            Ok(mut real) => {
                real.extend(missing.iter().rev());
                if let Some(leaf) = leaf {
                    real.push(leaf);
                }
                return real;
            }
            Err(_) => match (current.parent(), current.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name);
                    current = parent;
                }
                _ => return path.to_path_buf(),
            },
        }
    }
}

impl NodeBackend for FsBackend {
    async fn stat(&self, path: &Path) -> Result<DirEntry, BackendError> {
        let path = self.resolve(path, false).await?;
        stat_entry(&path).await
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>, BackendError> {
        let path = self.resolve(path, true).await?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        if !meta.is_dir() {
            return Err(BackendError::NotADirectory { path });
        }

        let mut children = Vec::new();
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        while let Some(child) = dir.next_entry().await.map_err(|e| io_err(&path, e))? {
            let child_path = child.path();
            if let Some(filter) = &self.filter {
                let attrs = match child.metadata().await {
                    Ok(meta) => EntryAttributes::from_metadata(&child_path, &meta),
                    Err(_) => EntryAttributes::from_name(&child_path),
                };
                if filter.is_excluded(&child_path, &attrs) {
                    continue;
                }
            }
            match stat_entry(&child_path).await {
                Ok(entry) => children.push(entry),
                // Raced with a delete.
                Err(BackendError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(children)
    }

    async fn open(&self, path: &Path, mode: OpenMode) -> Result<tokio::fs::File, BackendError> {
        let path = self.resolve(path, true).await?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        if meta.is_dir() {
            return Err(BackendError::IsADirectory { path });
        }
        tokio::fs::OpenOptions::new()
            .read(true)
            .write(mode.is_writable())
            .open(&path)
            .await
            .map_err(|e| io_err(&path, e))
    }

    async fn create(&self, path: &Path, kind: EntryKind) -> Result<DirEntry, BackendError> {
        let path = self.resolve_inner(path).await?;
        match kind {
            EntryKind::File => {
                tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .await
                    .map_err(|e| io_err(&path, e))?;
            }
            EntryKind::Directory => {
                tokio::fs::create_dir(&path)
                    .await
                    .map_err(|e| io_err(&path, e))?;
            }
            EntryKind::Symlink => {
                return Err(BackendError::Unsupported {
                    path,
                    kind: "symlink",
                })
            }
        }
        stat_entry(&path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        let from = self.resolve_inner(from).await?;
        let to = self.resolve_inner(to).await?;
        tokio::fs::symlink_metadata(&from)
            .await
            .map_err(|e| io_err(&from, e))?;
        if tokio::fs::symlink_metadata(&to).await.is_ok() {
            return Err(BackendError::AlreadyExists { path: to });
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| io_err(&from, e))
    }

    async fn remove(&self, path: &Path) -> Result<(), BackendError> {
        let path = self.resolve_inner(path).await?;
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| io_err(&path, e))
    }
}

// ---------------------------------------------------------------------------
// Entry construction
// ---------------------------------------------------------------------------

async fn stat_entry(path: &Path) -> Result<DirEntry, BackendError> {
    let meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| io_err(path, e))?;
    let file_type = meta.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::UNIX_EPOCH);
    let content_id = content_id(path, kind).await?;

    Ok(DirEntry {
        path: path.to_path_buf(),
        name: entry_name(path),
        kind,
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        modified,
        content_id,
    })
}

/// SHA-256 of the file bytes, the sorted child names, or the link target.
pub async fn content_id(path: &Path, kind: EntryKind) -> Result<ContentId, BackendError> {
    let mut hasher = Sha256::new();
    match kind {
        EntryKind::File => {
            let mut file = tokio::fs::File::open(path)
                .await
                .map_err(|e| io_err(path, e))?;
            let mut buf = vec![0u8; HASH_CHUNK];
            loop {
                let n = file.read(&mut buf).await.map_err(|e| io_err(path, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        EntryKind::Directory => {
            let mut names = Vec::new();
            let mut dir = tokio::fs::read_dir(path)
                .await
                .map_err(|e| io_err(path, e))?;
            while let Some(child) = dir.next_entry().await.map_err(|e| io_err(path, e))? {
                names.push(child.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            for name in names {
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
            }
        }
        EntryKind::Symlink => {
            let target = tokio::fs::read_link(path)
                .await
                .map_err(|e| io_err(path, e))?;
            hasher.update(target.to_string_lossy().as_bytes());
        }
    }
    Ok(ContentId(hex::encode(hasher.finalize())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use spaced_core::filter::SystemEntryFilter;
    use tempfile::TempDir;

    fn backend(root: &TempDir) -> FsBackend {
        FsBackend::new([root.path().to_path_buf()])
    }

    #[tokio::test]
    async fn stat_file_reports_size_and_hash() {
        let root = TempDir::new().expect("tempdir");
        let file = root.path().join("f.txt");
        std::fs::write(&file, b"hello").expect("write");

        let entry = backend(&root).stat(&file).await.expect("stat");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, 5);
        assert_eq!(entry.name, "f.txt");
        assert_eq!(
            entry.content_id.0,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn directory_hash_tracks_child_names() {
        let root = TempDir::new().expect("tempdir");
        let be = backend(&root);
        let before = be.stat(root.path()).await.expect("stat").content_id;
        std::fs::write(root.path().join("a"), b"").expect("write");
        let after = be.stat(root.path()).await.expect("stat").content_id;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn paths_outside_roots_are_not_found() {
        let root = TempDir::new().expect("tempdir");
        let other = TempDir::new().expect("tempdir");
        std::fs::write(other.path().join("x"), b"x").expect("write");

        let err = backend(&root)
            .stat(&other.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound { .. }));

        let escape = root.path().join("..").join("elsewhere");
        assert!(matches!(
            backend(&root).stat(&escape).await,
            Err(BackendError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_skips_filtered_children() {
        let root = TempDir::new().expect("tempdir");
        std::fs::write(root.path().join(".DS_Store"), b"").expect("write");
        std::fs::write(root.path().join("keep.txt"), b"").expect("write");

        let be = backend(&root).with_filter(Arc::new(SystemEntryFilter));
        let names: Vec<_> = be
            .list(root.path())
            .await
            .expect("list")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["keep.txt".to_string()]);
    }

    #[tokio::test]
    async fn list_of_file_is_not_a_directory() {
        let root = TempDir::new().expect("tempdir");
        let file = root.path().join("f");
        std::fs::write(&file, b"").expect("write");
        assert!(matches!(
            backend(&root).list(&file).await,
            Err(BackendError::NotADirectory { .. })
        ));
    }

    #[tokio::test]
    async fn create_rename_remove() {
        let root = TempDir::new().expect("tempdir");
        let be = backend(&root);
        let dir = root.path().join("docs");
        let entry = be.create(&dir, EntryKind::Directory).await.expect("mkdir");
        assert!(entry.is_dir());
        assert!(matches!(
            be.create(&dir, EntryKind::Directory).await,
            Err(BackendError::AlreadyExists { .. })
        ));

        let moved = root.path().join("papers");
        be.rename(&dir, &moved).await.expect("rename");
        assert!(!dir.exists());
        assert!(moved.is_dir());

        be.remove(&moved).await.expect("remove");
        assert!(!moved.exists());
        assert!(matches!(
            be.remove(&moved).await,
            Err(BackendError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn root_cannot_be_removed() {
        let root = TempDir::new().expect("tempdir");
        assert!(matches!(
            backend(&root).remove(root.path()).await,
            Err(BackendError::RootEntry { .. })
        ));
        assert!(root.path().exists());
    }

    #[tokio::test]
    async fn open_directory_is_rejected() {
        let root = TempDir::new().expect("tempdir");
        assert!(matches!(
            backend(&root).open(root.path(), OpenMode::Read).await,
            Err(BackendError::IsADirectory { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_cannot_reach_outside_roots() {
        let root = TempDir::new().expect("tempdir");
        let outside = TempDir::new().expect("tempdir");
        std::fs::write(outside.path().join("secret"), b"top-secret").expect("write");
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).expect("dir link");
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("flink"))
            .expect("file link");

        let be = backend(&root);
        let through_dir = root.path().join("link").join("secret");
        assert!(matches!(
            be.open(&through_dir, OpenMode::Read).await,
            Err(BackendError::NotFound { .. })
        ));
        assert!(matches!(
            be.stat(&through_dir).await,
            Err(BackendError::NotFound { .. })
        ));
        assert!(matches!(
            be.list(&root.path().join("link")).await,
            Err(BackendError::NotFound { .. })
        ));
        assert!(matches!(
            be.open(&root.path().join("flink"), OpenMode::Read).await,
            Err(BackendError::NotFound { .. })
        ));
        assert!(matches!(
            be.create(&root.path().join("link").join("planted"), EntryKind::File)
                .await,
            Err(BackendError::NotFound { .. })
        ));
        assert!(!outside.path().join("planted").exists());

        // The link itself is still an entry of the root.
        let link = be.stat(&root.path().join("link")).await.expect("stat link");
        assert_eq!(link.kind, EntryKind::Symlink);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_within_roots_are_followed() {
        let root = TempDir::new().expect("tempdir");
        std::fs::create_dir(root.path().join("sub")).expect("mkdir");
        std::fs::write(root.path().join("sub").join("f.txt"), b"hi").expect("write");
        std::os::unix::fs::symlink(root.path().join("sub"), root.path().join("alias"))
            .expect("link");

        let be = backend(&root);
        let via_alias = root.path().join("alias").join("f.txt");
        assert_eq!(be.stat(&via_alias).await.expect("stat").size, 2);
        be.open(&via_alias, OpenMode::Read).await.expect("open");
        assert_eq!(be.list(&root.path().join("alias")).await.expect("list").len(), 1);
    }
}
