//! Shared fixtures for cache integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spaced_cache::{BackendError, FsBackend, MetadataCache, NodeBackend, OpenMode};
use spaced_core::config::CacheConfig;
use spaced_core::types::{DirEntry, EntryKind, NodeHealth, NodeState};
use tempfile::TempDir;
use tokio::sync::{watch, Semaphore};

/// [`FsBackend`] that counts round trips and can stall them.
pub struct CountingBackend {
    inner: FsBackend,
    pub stats: AtomicUsize,
    pub lists: AtomicUsize,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl CountingBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: FsBackend::new([root.to_path_buf()]),
            stats: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            delay: None,
            gate: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every fetch waits for a permit from `gate` before touching disk.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn stat_count(&self) -> usize {
        self.stats.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    async fn stall(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
    }
}

impl NodeBackend for CountingBackend {
    async fn stat(&self, path: &Path) -> Result<DirEntry, BackendError> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        self.inner.stat(path).await
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>, BackendError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        self.inner.list(path).await
    }

    async fn open(&self, path: &Path, mode: OpenMode) -> Result<tokio::fs::File, BackendError> {
        self.inner.open(path, mode).await
    }

    async fn create(&self, path: &Path, kind: EntryKind) -> Result<DirEntry, BackendError> {
        self.inner.create(path, kind).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        self.inner.rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> Result<(), BackendError> {
        self.inner.remove(path).await
    }
}

pub fn running() -> watch::Sender<NodeHealth> {
    let (tx, _rx) = watch::channel(NodeHealth {
        state: NodeState::Running,
        pid: Some(4242),
        ..NodeHealth::default()
    });
    tx
}

pub struct Fixture {
    pub root: TempDir,
    pub health: watch::Sender<NodeHealth>,
    pub cache: Arc<MetadataCache<CountingBackend>>,
}

impl Fixture {
    pub fn backend(&self) -> &CountingBackend {
        self.cache.backend()
    }
}

pub fn fixture() -> Fixture {
    fixture_with(|b| b)
}

pub fn fixture_with(build: impl FnOnce(CountingBackend) -> CountingBackend) -> Fixture {
    let root = TempDir::new().expect("tempdir");
    let backend = build(CountingBackend::new(root.path()));
    let health = running();
    let cache = MetadataCache::new(
        Arc::new(backend),
        health.subscribe(),
        &CacheConfig::default(),
    );
    Fixture {
        root,
        health,
        cache: Arc::new(cache),
    }
}
