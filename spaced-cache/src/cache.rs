//! Metadata cache in front of a [`NodeBackend`].
//!
//! Two tables, one for single entries and one for directory listings, each
//! mapping a path to a slot. A slot is either a cached value or a fetch in
//! flight. Concurrent callers missing on the same path join the in-flight
//! fetch through a [`Shared`] future, so the backend sees one request.
//!
//! Every fetch carries a flight id. Invalidation removes in-flight slots, so a
//! fetch that finishes after an invalidating event finds its id gone and is
//! not cached; its callers fetch again instead of serving the stale result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt as _;
use spaced_core::config::CacheConfig;
use spaced_core::lifecycle::Component;
use spaced_core::permissions::Access;
use spaced_core::types::{normalize_path, DirEntry, EntryKind, NodeHealth, NodeState, WatchEvent};
use spaced_core::RequestContext;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::backend::NodeBackend;
use crate::datasource::DataSource;
use crate::error::DataSourceError;
use crate::stream::{OpenMode, ScopedStream};

/// Give up refetching after this many invalidations raced one lookup and
/// serve the newest result uncached.
const MAX_FETCH_ATTEMPTS: usize = 3;

type Fetch<T> = Shared<BoxFuture<'static, Result<T, DataSourceError>>>;

struct Cached<T> {
    value: T,
    valid: bool,
    /// Flight that produced the value; 0 for entries seeded from a listing.
    flight: u64,
    fetched_at: Instant,
    last_used: Instant,
}

enum Slot<T> {
    Ready(Cached<T>),
    InFlight { id: u64, fetch: Fetch<T> },
}

type Table<T> = HashMap<PathBuf, Slot<T>>;

#[derive(Default)]
struct Tables {
    entries: Table<Arc<DirEntry>>,
    listings: Table<Arc<Vec<DirEntry>>>,
    next_flight: u64,
}

impl Tables {
    /// Mark `path` stale and drop its own listing.
    fn invalidate(&mut self, path: &Path) {
        let in_flight = match self.entries.get_mut(path) {
            Some(Slot::Ready(cached)) => {
                cached.valid = false;
                false
            }
            Some(Slot::InFlight { .. }) => true,
            None => false,
        };
        if in_flight {
            self.entries.remove(path);
        }
        self.listings.remove(path);
    }

    /// A child changed: the parent's listing, content id and mtime are stale.
    fn invalidate_parent(&mut self, path: &Path) {
        if let Some(parent) = path.parent() {
            self.invalidate(parent);
        }
    }

    /// Forget `path` and everything below it.
    fn remove_tree(&mut self, path: &Path) {
        self.entries.retain(|p, _| !p.starts_with(path));
        self.listings.retain(|p, _| !p.starts_with(path));
    }

    fn evict_idle(&mut self, now: Instant, idle: Duration) -> usize {
        let before = self.entries.len() + self.listings.len();
        self.entries.retain(|_, slot| keep_slot(slot, now, idle));
        self.listings.retain(|_, slot| keep_slot(slot, now, idle));
        before - (self.entries.len() + self.listings.len())
    }
}

fn keep_slot<T>(slot: &Slot<T>, now: Instant, idle: Duration) -> bool {
    match slot {
        Slot::Ready(cached) => now.saturating_duration_since(cached.last_used) <= idle,
        Slot::InFlight { .. } => true,
    }
}

/// A value type the cache keeps a table for.
trait Cacheable: Clone + Send + Sync + 'static {
    fn table(tables: &mut Tables) -> &mut Table<Self>;

    fn on_ready(_tables: &mut Tables, _path: &Path, _value: &Self, _now: Instant) {}
}

impl Cacheable for Arc<DirEntry> {
    fn table(tables: &mut Tables) -> &mut Table<Self> {
        &mut tables.entries
    }
}

impl Cacheable for Arc<Vec<DirEntry>> {
    fn table(tables: &mut Tables) -> &mut Table<Self> {
        &mut tables.listings
    }

    /// A fresh listing doubles as a fetch of every child without a slot.
    fn on_ready(tables: &mut Tables, _path: &Path, value: &Self, now: Instant) {
        for child in value.iter() {
            tables
                .entries
                .entry(child.path.clone())
                .or_insert_with(|| {
                    Slot::Ready(Cached {
                        value: Arc::new(child.clone()),
                        valid: true,
                        flight: 0,
                        fetched_at: now,
                        last_used: now,
                    })
                });
        }
    }
}

/// Counts of what the cache currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub listings: usize,
    pub in_flight: usize,
}

pub struct MetadataCache<B: NodeBackend> {
    backend: Arc<B>,
    health: watch::Receiver<NodeHealth>,
    entry_ttl: Duration,
    idle_eviction: Duration,
    sweep_interval: Duration,
    tables: RwLock<Tables>,
    span: Span,
}

impl<B: NodeBackend> MetadataCache<B> {
    /// `health` gates every lookup: only a `Running` node is served.
    pub fn new(backend: Arc<B>, health: watch::Receiver<NodeHealth>, config: &CacheConfig) -> Self {
        Self {
            backend,
            health,
            entry_ttl: config.entry_ttl(),
            idle_eviction: config.idle_eviction(),
            sweep_interval: config.sweep_interval(),
            tables: RwLock::new(Tables::default()),
            span: tracing::info_span!("cache"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn stats(&self) -> CacheStats {
        let tables = self.tables.read().await;
        let in_flight = tables
            .entries
            .values()
            .filter(|slot| matches!(slot, Slot::InFlight { .. }))
            .count()
            + tables
                .listings
                .values()
                .filter(|slot| matches!(slot, Slot::InFlight { .. }))
                .count();
        CacheStats {
            entries: tables.entries.len(),
            listings: tables.listings.len(),
            in_flight,
        }
    }

    // -----------------------------------------------------------------------
    // Invalidation and eviction
    // -----------------------------------------------------------------------

    /// Apply one filesystem change. Takes effect before any later lookup.
    pub async fn apply(&self, event: &WatchEvent) {
        let mut tables = self.tables.write().await;
        match event {
            WatchEvent::Created(path) | WatchEvent::Modified(path) => {
                tables.invalidate(path);
                tables.invalidate_parent(path);
            }
            WatchEvent::Deleted(path) => {
                tables.remove_tree(path);
                tables.invalidate_parent(path);
            }
            WatchEvent::Renamed { from, to } => {
                tables.remove_tree(from);
                tables.remove_tree(to);
                tables.invalidate_parent(from);
                tables.invalidate_parent(to);
            }
        }
        tracing::trace!(parent: &self.span, kind = %event.kind(), path = %event.path().display(), "invalidated");
    }

    /// Drop everything. Used when the event stream can no longer be trusted.
    pub async fn invalidate_all(&self) {
        let mut tables = self.tables.write().await;
        let dropped = tables.entries.len() + tables.listings.len();
        tables.entries.clear();
        tables.listings.clear();
        tracing::info!(parent: &self.span, dropped, "cache cleared");
    }

    /// Evict entries unused since `now - idle_eviction`. Returns how many went.
    pub async fn evict_idle(&self, now: Instant) -> usize {
        let evicted = self.tables.write().await.evict_idle(now, self.idle_eviction);
        if evicted > 0 {
            tracing::debug!(parent: &self.span, evicted, "evicted idle entries");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every sweep interval until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.evict_idle(Instant::now()).await;
                }
            }
        }
        tracing::debug!(parent: &self.span, "sweeper stopped");
    }

    // -----------------------------------------------------------------------
    // Lookup machinery
    // -----------------------------------------------------------------------

    /// Normalize `path`, then check permission, context and node state, in that order.
    fn admit(
        &self,
        ctx: &RequestContext,
        path: &Path,
        access: Access,
    ) -> Result<PathBuf, DataSourceError> {
        let path = normalize_path(path).ok_or_else(|| DataSourceError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        if !ctx.caller().allows(access, &path) {
            return Err(DataSourceError::PermissionDenied { path, access });
        }
        ctx.check()?;
        let state = self.health.borrow().state;
        if state != NodeState::Running {
            return Err(DataSourceError::BackendUnavailable { state });
        }
        Ok(path)
    }

    async fn lookup<T, F>(
        &self,
        ctx: &RequestContext,
        path: &Path,
        fetch: F,
    ) -> Result<T, DataSourceError>
    where
        T: Cacheable,
        F: Fn() -> BoxFuture<'static, Result<T, DataSourceError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (id, flight) = {
                let mut tables = self.tables.write().await;
                let now = Instant::now();
                let existing = match T::table(&mut tables).get_mut(path) {
                    Some(Slot::Ready(cached))
                        if cached.valid
                            && now.saturating_duration_since(cached.fetched_at) < self.entry_ttl =>
                    {
                        cached.last_used = now;
                        return Ok(cached.value.clone());
                    }
                    Some(Slot::InFlight { id, fetch }) => Some((*id, fetch.clone())),
                    _ => None,
                };
                match existing {
                    Some(joined) => joined,
                    None => {
                        tables.next_flight += 1;
                        let id = tables.next_flight;
                        let flight = fetch().shared();
                        T::table(&mut tables).insert(
                            path.to_path_buf(),
                            Slot::InFlight {
                                id,
                                fetch: flight.clone(),
                            },
                        );
                        tracing::trace!(parent: &self.span, path = %path.display(), id, "fetch started");
                        (id, flight)
                    }
                }
            };

            let outcome = ctx.run(flight).await;

            let mut tables = self.tables.write().await;
            let table = T::table(&mut tables);
            let (current, promoted) = match table.get(path) {
                Some(Slot::InFlight { id: current, .. }) => (*current == id, false),
                Some(Slot::Ready(cached)) => (cached.flight == id && cached.valid, true),
                None => (false, false),
            };

            let value = match outcome {
                Err(interrupted) => {
                    // Nobody else waits on the fetch: drop it with the slot.
                    let orphaned = current
                        && matches!(
                            table.get(path),
                            Some(Slot::InFlight { fetch, .. }) if fetch.strong_count() == Some(1)
                        );
                    if orphaned {
                        table.remove(path);
                    }
                    return Err(interrupted.into());
                }
                Ok(Err(err)) => {
                    if current && !promoted {
                        table.remove(path);
                    }
                    return Err(err);
                }
                Ok(Ok(value)) => value,
            };

            if current {
                if !promoted {
                    let now = Instant::now();
                    table.insert(
                        path.to_path_buf(),
                        Slot::Ready(Cached {
                            value: value.clone(),
                            valid: true,
                            flight: id,
                            fetched_at: now,
                            last_used: now,
                        }),
                    );
                    T::on_ready(&mut tables, path, &value, now);
                }
                return Ok(value);
            }
            if attempt >= MAX_FETCH_ATTEMPTS {
                tracing::debug!(parent: &self.span, path = %path.display(), "serving uncached result after repeated invalidation");
                return Ok(value);
            }
            tracing::trace!(parent: &self.span, path = %path.display(), id, "invalidated in flight; refetching");
        }
    }

    fn stat_fetch(&self, path: &Path) -> BoxFuture<'static, Result<Arc<DirEntry>, DataSourceError>> {
        let backend = Arc::clone(&self.backend);
        let path = path.to_path_buf();
        async move {
            backend
                .stat(&path)
                .await
                .map(Arc::new)
                .map_err(DataSourceError::from)
        }
        .boxed()
    }

    fn list_fetch(
        &self,
        path: &Path,
    ) -> BoxFuture<'static, Result<Arc<Vec<DirEntry>>, DataSourceError>> {
        let backend = Arc::clone(&self.backend);
        let path = path.to_path_buf();
        async move {
            let mut children = backend.list(&path).await?;
            children.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(Arc::new(children))
        }
        .boxed()
    }
}

impl<B: NodeBackend> DataSource for MetadataCache<B> {
    async fn get(&self, ctx: &RequestContext, path: &Path) -> Result<DirEntry, DataSourceError> {
        let path = self.admit(ctx, path, Access::Read)?;
        let entry = self.lookup(ctx, &path, || self.stat_fetch(&path)).await?;
        Ok(DirEntry::clone(&entry))
    }

    async fn get_children(
        &self,
        ctx: &RequestContext,
        path: &Path,
    ) -> Result<Vec<DirEntry>, DataSourceError> {
        let path = self.admit(ctx, path, Access::Read)?;
        let listing = self.lookup(ctx, &path, || self.list_fetch(&path)).await?;
        Ok(Vec::clone(&listing))
    }

    async fn open(
        &self,
        ctx: &RequestContext,
        path: &Path,
        mode: OpenMode,
    ) -> Result<ScopedStream, DataSourceError> {
        let access = if mode.is_writable() {
            Access::Write
        } else {
            Access::Read
        };
        let path = self.admit(ctx, path, access)?;
        let file = ctx.run(self.backend.open(&path, mode)).await??;
        tracing::debug!(parent: &self.span, path = %path.display(), ?mode, "stream opened");
        Ok(ScopedStream::new(path, mode, file))
    }

    async fn create_entry(
        &self,
        ctx: &RequestContext,
        path: &Path,
        kind: EntryKind,
    ) -> Result<DirEntry, DataSourceError> {
        let path = self.admit(ctx, path, Access::Write)?;
        let entry = ctx.run(self.backend.create(&path, kind)).await??;
        self.apply(&WatchEvent::Created(path)).await;
        Ok(entry)
    }

    async fn rename_entry(
        &self,
        ctx: &RequestContext,
        from: &Path,
        to: &Path,
    ) -> Result<(), DataSourceError> {
        let from = self.admit(ctx, from, Access::Write)?;
        let to = self.admit(ctx, to, Access::Write)?;
        ctx.run(self.backend.rename(&from, &to)).await??;
        self.apply(&WatchEvent::Renamed { from, to }).await;
        Ok(())
    }

    async fn delete_entry(&self, ctx: &RequestContext, path: &Path) -> Result<(), DataSourceError> {
        let path = self.admit(ctx, path, Access::Write)?;
        ctx.run(self.backend.remove(&path)).await??;
        self.apply(&WatchEvent::Deleted(path)).await;
        Ok(())
    }
}

impl<B: NodeBackend> Component for MetadataCache<B> {
    type Error = DataSourceError;

    /// Drops every cached value and in-flight fetch. Safe to repeat.
    async fn shutdown(&self) -> Result<(), DataSourceError> {
        let mut tables = self.tables.write().await;
        tables.entries.clear();
        tables.listings.clear();
        Ok(())
    }
}
