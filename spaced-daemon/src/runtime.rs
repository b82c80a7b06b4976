//! Daemon runtime: node supervisor, file watcher, and metadata cache wired
//! under one cancellation tree.
//!
//! Startup order is supervisor, cache, watcher; shutdown runs the reverse so
//! nothing keeps feeding a component that is already gone.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use spaced_cache::{FsBackend, MetadataCache};
use spaced_core::config::{self, DaemonConfig, LogConfig};
use spaced_core::{platform_filter, Component, NodeState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{io_err, DaemonError, WatchError};
use crate::log_rotation::rotate_node_logs;
use crate::paths::{logs_dir, LOG_ROTATION_INTERVAL, STATUS_REFRESH_INTERVAL};
use crate::status::{self, StatusSnapshot};
use crate::supervisor::NodeSupervisor;
use crate::watcher::{FileWatcher, WatchStream};

pub type Cache = MetadataCache<FsBackend>;

/// Load config, install tracing, and block the current thread until the
/// daemon exits on SIGTERM or ctrl-c.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = config::load_at(home)?;
    config.validate()?;
    init_tracing(&config.log);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run until SIGTERM or ctrl-c.
pub async fn run(home: PathBuf, config: DaemonConfig) -> Result<(), DaemonError> {
    // Installed before the pid file exists, so an early stop is never fatal.
    let shutdown = shutdown_signal()?;
    run_until(home, config, shutdown).await
}

/// Run until `shutdown` resolves.
pub async fn run_until(
    home: PathBuf,
    config: DaemonConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DaemonError> {
    let daemon = Daemon::start(&home, config).await?;
    let cancel = daemon.cancel_token();
    tokio::select! {
        _ = shutdown => info!("shutdown requested"),
        _ = cancel.cancelled() => {}
    }
    daemon.shutdown().await
}

/// Level from `RUST_LOG` if set, else from the config file.
pub fn init_tracing(log: &LogConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = ()>, DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(|e| io_err("SIGINT handler", e))?;
    Ok(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = interrupt.recv() => info!("received ctrl-c"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = ()>, DaemonError> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(err) => {
                warn!(error = %err, "ctrl-c handler failed");
                std::future::pending::<()>().await;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// A running daemon. Stop it with [`shutdown`](Self::shutdown).
pub struct Daemon {
    home: PathBuf,
    cancel: CancellationToken,
    supervisor: Arc<NodeSupervisor>,
    cache: Arc<Cache>,
    watcher: Arc<FileWatcher>,
    started_at: DateTime<Utc>,
    tasks: Vec<(&'static str, JoinHandle<Result<(), DaemonError>>)>,
}

impl Daemon {
    pub async fn start(home: &Path, config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        if let Some(pid) = status::running_pid_at(home)? {
            return Err(DaemonError::AlreadyRunning { pid });
        }
        ensure_runtime_dirs(home, &config)?;
        status::write_pid_at(home, std::process::id())?;

        match Self::launch(home, config).await {
            Ok(daemon) => Ok(daemon),
            Err(err) => {
                let _ = status::remove_pid_at(home);
                Err(err)
            }
        }
    }

    async fn launch(home: &Path, config: DaemonConfig) -> Result<Self, DaemonError> {
        let cancel = CancellationToken::new();
        let started_at = Utc::now();

        // Watch notifications carry canonical paths; the cache must key on the same.
        let mut roots = Vec::with_capacity(config.watcher.roots.len());
        for root in &config.watcher.roots {
            roots.push(fs::canonicalize(root).map_err(|e| io_err(root, e))?);
        }

        let supervisor = Arc::new(NodeSupervisor::new(
            config.node.clone(),
            logs_dir(home),
            &cancel,
        ));
        supervisor.start().await?;

        let backend = FsBackend::new(roots).with_filter(platform_filter());
        let cache = Arc::new(MetadataCache::new(
            Arc::new(backend),
            supervisor.subscribe(),
            &config.cache,
        ));

        let watcher = match FileWatcher::new(&config.watcher, platform_filter(), &cancel) {
            Ok(watcher) => Arc::new(watcher),
            Err(err) => {
                cancel.cancel();
                let _ = supervisor.shutdown().await;
                return Err(err.into());
            }
        };
        let stream = match watcher.start() {
            Ok(stream) => stream,
            Err(err) => {
                cancel.cancel();
                let _ = watcher.shutdown().await;
                let _ = supervisor.shutdown().await;
                return Err(err.into());
            }
        };

        let mut tasks = Vec::new();
        tasks.push((
            "invalidation",
            tokio::spawn(invalidation_task(stream, Arc::clone(&cache), cancel.clone())),
        ));
        tasks.push((
            "sweeper",
            tokio::spawn({
                let cache = Arc::clone(&cache);
                let cancel = cancel.clone();
                async move {
                    cache.run_sweeper(cancel).await;
                    Ok(())
                }
            }),
        ));
        tasks.push((
            "status",
            tokio::spawn(status_task(
                home.to_path_buf(),
                started_at,
                Arc::clone(&supervisor),
                Arc::clone(&cache),
                Arc::clone(&watcher),
                cancel.clone(),
            )),
        ));
        tasks.push((
            "log_rotation",
            tokio::spawn(log_rotation_task(home.to_path_buf(), cancel.clone())),
        ));

        info!(
            pid = std::process::id(),
            roots = watcher.roots().len(),
            "daemon started"
        );
        Ok(Self {
            home: home.to_path_buf(),
            cancel,
            supervisor,
            cache,
            watcher,
            started_at,
            tasks,
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn supervisor(&self) -> &Arc<NodeSupervisor> {
        &self.supervisor
    }

    pub fn watcher(&self) -> &Arc<FileWatcher> {
        &self.watcher
    }

    /// Fires when the daemon begins shutting down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Orderly teardown: watcher, then cache, then node. Every component is
    /// shut down even if an earlier one fails; the first error is returned.
    pub async fn shutdown(self) -> Result<(), DaemonError> {
        info!("daemon shutting down");
        self.cancel.cancel();

        let mut first_err: Option<DaemonError> = None;
        let mut record = |result: Result<(), DaemonError>| {
            if let Err(err) = result {
                warn!(error = %err, "shutdown step failed");
                first_err.get_or_insert(err);
            }
        };

        record(self.watcher.shutdown().await.map_err(DaemonError::from));
        for (name, handle) in self.tasks {
            record(handle_join(name, handle.await));
        }
        record(self.cache.shutdown().await.map_err(DaemonError::from));
        record(self.supervisor.shutdown().await.map_err(DaemonError::from));

        let snapshot = snapshot(
            self.started_at,
            &self.supervisor,
            &self.cache,
            &self.watcher,
            false,
        )
        .await;
        record(status::write_status_at(&self.home, &snapshot));
        record(status::remove_pid_at(&self.home));

        info!("daemon stopped");
        first_err.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Feed watcher events into the cache. An overflow means events were lost, so
/// nothing cached can be trusted.
async fn invalidation_task(
    mut stream: WatchStream,
    cache: Arc<Cache>,
    cancel: CancellationToken,
) -> Result<(), DaemonError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => cache.apply(&event).await,
            Some(Err(WatchError::Overflow { dropped })) => {
                warn!(dropped, "watch overflow; invalidating cache");
                cache.invalidate_all().await;
            }
            Some(Err(err)) => warn!(error = %err, "watch stream error"),
            None => break,
        }
    }
    Ok(())
}

async fn status_task(
    home: PathBuf,
    started_at: DateTime<Utc>,
    supervisor: Arc<NodeSupervisor>,
    cache: Arc<Cache>,
    watcher: Arc<FileWatcher>,
    cancel: CancellationToken,
) -> Result<(), DaemonError> {
    let mut health = supervisor.subscribe();
    let mut interval = tokio::time::interval(STATUS_REFRESH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        let snap = snapshot(started_at, &supervisor, &cache, &watcher, true).await;
        if let Err(err) = status::write_status_at(&home, &snap) {
            warn!(error = %err, "status write failed");
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = interval.tick() => {}
        }
    }
    Ok(())
}

async fn log_rotation_task(home: PathBuf, cancel: CancellationToken) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(LOG_ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Rotation logs its own failures.
                tokio::task::spawn_blocking(move || rotate_node_logs(&home)).await.ok();
            }
        }
    }
    Ok(())
}

async fn snapshot(
    started_at: DateTime<Utc>,
    supervisor: &NodeSupervisor,
    cache: &Cache,
    watcher: &FileWatcher,
    running: bool,
) -> StatusSnapshot {
    let stats = cache.stats().await;
    let mut node = supervisor.health();
    if !running && node.state == NodeState::Running {
        node.state = NodeState::Stopped;
    }
    StatusSnapshot {
        pid: std::process::id(),
        started_at,
        updated_at: Utc::now(),
        node,
        roots: watcher.roots().to_vec(),
        watch_overflows: watcher.overflow_count(),
        cache_entries: stats.entries,
        cache_listings: stats.listings,
        running,
    }
}

fn ensure_runtime_dirs(home: &Path, config: &DaemonConfig) -> Result<(), DaemonError> {
    status::ensure_run_dir(home)?;
    let logs = logs_dir(home);
    fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))?;
    for root in &config.watcher.roots {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
    }
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Task {
            task,
            reason: err.to_string(),
        }),
    }
}
