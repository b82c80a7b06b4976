//! Recursive filesystem watcher producing normalized [`WatchEvent`]s.
//!
//! The notify callback runs on the backend's own thread and must never block,
//! so it `try_send`s into a bounded channel and counts what does not fit. A
//! normalizer task drains that channel, pairs rename halves, drops hidden
//! paths, and forwards the result to the [`WatchStream`]. Dropped
//! notifications surface in-stream as [`WatchError::Overflow`] ahead of the
//! next event, so consumers know to invalidate everything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use spaced_core::filter::{EntryAttributes, PathFilter};
use spaced_core::types::normalize_path;
use spaced_core::{Component, WatchEvent, WatcherConfig};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::error::WatchError;

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Active {
    started: bool,
    watcher: Option<RecommendedWatcher>,
}

pub struct FileWatcher {
    roots: Vec<PathBuf>,
    capacity: usize,
    rename_window: Duration,
    filter: Arc<dyn PathFilter>,
    cancel: CancellationToken,
    overflowed: Arc<AtomicU64>,
    active: Mutex<Active>,
    span: Span,
}

impl FileWatcher {
    /// Roots must exist. They are canonicalized, and a root nested inside
    /// another is dropped since the outer recursive watch already covers it.
    pub fn new(
        config: &WatcherConfig,
        filter: Arc<dyn PathFilter>,
        parent: &CancellationToken,
    ) -> Result<Self, WatchError> {
        let mut roots = Vec::with_capacity(config.roots.len());
        for root in &config.roots {
            let canonical = std::fs::canonicalize(root).map_err(|source| WatchError::Root {
                path: root.clone(),
                source,
            })?;
            roots.push(canonical);
        }
        Ok(Self {
            roots: dedup_nested(roots),
            capacity: config.capacity.max(1),
            rename_window: config.rename_window(),
            filter,
            cancel: parent.child_token(),
            overflowed: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(Active::default()),
            span: tracing::info_span!("watcher"),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Canonical roots actually watched.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Total notifications dropped since start.
    pub fn overflow_count(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Begin watching. Only one stream exists per watcher.
    pub fn start(&self) -> Result<WatchStream, WatchError> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.started {
            return Err(WatchError::AlreadyRunning);
        }
        active.started = true;

        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<Event>>(self.capacity);
        let pending = Arc::new(AtomicU64::new(0));
        let callback_pending = Arc::clone(&pending);
        let total = Arc::clone(&self.overflowed);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Err(TrySendError::Full(_)) = raw_tx.try_send(res) {
                callback_pending.fetch_add(1, Ordering::Relaxed);
                total.fetch_add(1, Ordering::Relaxed);
            }
        })?;
        for root in &self.roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            info!(parent: &self.span, root = %root.display(), "watching");
        }
        active.watcher = Some(watcher);

        let (tx, rx) = mpsc::channel(self.capacity);
        let normalizer = Normalizer::new(self.roots.clone(), Arc::clone(&self.filter), self.rename_window);
        tokio::spawn(
            normalize_loop(raw_rx, tx, pending, normalizer, self.cancel.clone())
                .instrument(self.span.clone()),
        );
        Ok(WatchStream { rx })
    }
}

impl Component for FileWatcher {
    type Error = WatchError;

    /// Stops the OS watch and ends the stream. Idempotent.
    async fn shutdown(&self) -> Result<(), WatchError> {
        self.cancel.cancel();
        let watcher = self
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .watcher
            .take();
        if watcher.is_some() {
            info!(parent: &self.span, "watcher stopped");
        }
        drop(watcher);
        Ok(())
    }
}

/// Normalized events from a running [`FileWatcher`]. Ends after shutdown.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::Receiver<Result<WatchEvent, WatchError>>,
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent, WatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

async fn normalize_loop(
    mut raw: mpsc::Receiver<notify::Result<Event>>,
    tx: mpsc::Sender<Result<WatchEvent, WatchError>>,
    pending: Arc<AtomicU64>,
    mut normalizer: Normalizer,
    cancel: CancellationToken,
) {
    loop {
        let deadline = normalizer.next_deadline();
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let mut out = Vec::new();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = raw.recv() => {
                let Some(next) = next else { break };
                let dropped = pending.swap(0, Ordering::Relaxed);
                if dropped > 0 {
                    warn!(dropped, "watch buffer overflowed");
                    out.push(Err(WatchError::Overflow { dropped }));
                }
                match next {
                    Ok(event) if event.need_rescan() => {
                        warn!("platform watcher lost events");
                        out.push(Err(WatchError::Overflow { dropped: 0 }));
                    }
                    Ok(event) => out.extend(normalizer.push(event, Instant::now()).into_iter().map(Ok)),
                    Err(err) => warn!(error = %err, "watch backend error"),
                }
            }
            _ = expiry => out.extend(normalizer.expire(Instant::now()).into_iter().map(Ok)),
        }

        for item in out {
            if let Ok(event) = &item {
                debug!(kind = %event.kind(), path = %event.path().display(), "watch event");
            }
            if tx.send(item).await.is_err() {
                debug!("watch stream dropped");
                return;
            }
        }
    }
    debug!("watch loop finished");
}

/// Keep only roots not contained in another root.
fn dedup_nested(mut roots: Vec<PathBuf>) -> Vec<PathBuf> {
    roots.sort();
    roots.dedup();
    let mut kept: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        if !kept.iter().any(|outer| root.starts_with(outer)) {
            kept.push(root);
        }
    }
    kept
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Turns raw notify events into [`WatchEvent`]s.
///
/// Platforms report a rename as separate "from" and "to" halves, sometimes
/// followed by a combined event. Halves sharing a tracker cookie pair up; halves
/// without one pair in arrival order. A "from" left unpaired past the rename
/// window was a move out of the watched tree and becomes a delete.
struct Normalizer {
    roots: Vec<PathBuf>,
    filter: Arc<dyn PathFilter>,
    window: Duration,
    tracked_from: HashMap<usize, (PathBuf, Instant)>,
    untracked_from: Vec<(PathBuf, Instant)>,
    /// Trackers already paired, so a trailing combined event is skipped.
    paired: HashMap<usize, Instant>,
}

impl Normalizer {
    fn new(roots: Vec<PathBuf>, filter: Arc<dyn PathFilter>, window: Duration) -> Self {
        Self {
            roots,
            filter,
            window,
            tracked_from: HashMap::new(),
            untracked_from: Vec::new(),
            paired: HashMap::new(),
        }
    }

    fn push(&mut self, event: Event, now: Instant) -> Vec<WatchEvent> {
        let mut out = self.expire(now);
        let tracker = event.tracker();
        let mut paths = event
            .paths
            .iter()
            .filter_map(|p| normalize_path(p))
            .collect::<Vec<_>>();

        match event.kind {
            EventKind::Create(_) => {
                for path in paths {
                    self.flush_superseded(&mut out, &path);
                    self.emit(&mut out, WatchEvent::Created(path));
                }
            }
            EventKind::Remove(_) => {
                for path in paths {
                    self.flush_superseded(&mut out, &path);
                    self.emit(&mut out, WatchEvent::Deleted(path));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in paths {
                    match tracker {
                        Some(id) => {
                            self.tracked_from.insert(id, (path, now));
                        }
                        None => self.untracked_from.push((path, now)),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for to in paths {
                    let from = match tracker {
                        Some(id) => self.tracked_from.remove(&id).map(|(from, _)| {
                            self.paired.insert(id, now);
                            from
                        }),
                        None => (!self.untracked_from.is_empty())
                            .then(|| self.untracked_from.remove(0).0),
                    };
                    self.flush_superseded(&mut out, &to);
                    match from {
                        Some(from) => self.emit(&mut out, WatchEvent::Renamed { from, to }),
                        None => self.emit(&mut out, WatchEvent::Created(to)),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                if let Some(id) = tracker {
                    self.tracked_from.remove(&id);
                    if self.paired.remove(&id).is_some() {
                        return out;
                    }
                }
                let to = paths.remove(1);
                let from = paths.remove(0);
                self.flush_superseded(&mut out, &to);
                self.emit(&mut out, WatchEvent::Renamed { from, to });
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // No pairing information: judge by what is on disk now.
                for path in paths {
                    self.flush_superseded(&mut out, &path);
                    if path.symlink_metadata().is_ok() {
                        self.emit(&mut out, WatchEvent::Created(path));
                    } else {
                        self.emit(&mut out, WatchEvent::Deleted(path));
                    }
                }
            }
            EventKind::Modify(_) | EventKind::Any => {
                for path in paths {
                    self.flush_superseded(&mut out, &path);
                    self.emit(&mut out, WatchEvent::Modified(path));
                }
            }
            EventKind::Access(_) | EventKind::Other => {}
        }
        out
    }

    /// Flush "from" halves whose partner never arrived.
    fn expire(&mut self, now: Instant) -> Vec<WatchEvent> {
        let window = self.window;
        let mut out = Vec::new();
        let mut expired = Vec::new();
        self.tracked_from.retain(|_, (path, at)| {
            let keep = now.duration_since(*at) < window;
            if !keep {
                expired.push(path.clone());
            }
            keep
        });
        self.untracked_from.retain(|(path, at)| {
            let keep = now.duration_since(*at) < window;
            if !keep {
                expired.push(path.clone());
            }
            keep
        });
        self.paired.retain(|_, at| now.duration_since(*at) < window);
        for path in expired {
            self.emit(&mut out, WatchEvent::Deleted(path));
        }
        out
    }

    /// A held "from" at `path` or one of its ancestors goes out as a delete
    /// before anything newer about `path`.
    fn flush_superseded(&mut self, out: &mut Vec<WatchEvent>, path: &Path) {
        let mut superseded = Vec::new();
        self.tracked_from.retain(|_, (from, _)| {
            let hit = path.starts_with(from.as_path());
            if hit {
                superseded.push(from.clone());
            }
            !hit
        });
        self.untracked_from.retain(|(from, _)| {
            let hit = path.starts_with(from.as_path());
            if hit {
                superseded.push(from.clone());
            }
            !hit
        });
        for from in superseded {
            self.emit(out, WatchEvent::Deleted(from));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.tracked_from
            .values()
            .map(|(_, at)| *at)
            .chain(self.untracked_from.iter().map(|(_, at)| *at))
            .min()
            .map(|at| at + self.window)
    }

    /// Apply visibility rules; a rename across the visibility line degrades to
    /// a create or delete.
    fn emit(&self, out: &mut Vec<WatchEvent>, event: WatchEvent) {
        let event = match event {
            WatchEvent::Renamed { from, to } => match (self.visible(&from), self.visible(&to)) {
                (true, true) => WatchEvent::Renamed { from, to },
                (true, false) => WatchEvent::Deleted(from),
                (false, true) => WatchEvent::Created(to),
                (false, false) => return,
            },
            other if self.visible(other.path()) => other,
            _ => return,
        };
        out.push(event);
    }

    /// Under a root, and neither the path nor any ancestor below the root is
    /// excluded by the filter.
    fn visible(&self, path: &Path) -> bool {
        let Some(root) = self.roots.iter().find(|root| path.starts_with(root)) else {
            return false;
        };
        if path == root {
            return false;
        }
        let attrs = match path.symlink_metadata() {
            Ok(meta) => EntryAttributes::from_metadata(path, &meta),
            Err(_) => EntryAttributes::from_name(path),
        };
        if self.filter.is_excluded(path, &attrs) {
            return false;
        }
        path.ancestors()
            .skip(1)
            .take_while(|ancestor| *ancestor != root.as_path())
            .all(|ancestor| !self.filter.is_excluded(ancestor, &EntryAttributes::from_name(ancestor)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
