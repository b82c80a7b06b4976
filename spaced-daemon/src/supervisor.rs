//! Node process supervision.
//!
//! The supervisor owns exactly one child process for its whole life. A monitor
//! task holds the `Child`, waits for it to become ready, and then waits for
//! either an exit or a stop request. Every health transition is published on a
//! `watch` channel so the cache and the status writer see the same state.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use spaced_core::{
    AsyncComponent, Component, NodeConfig, NodeHealth, NodeState, ReadinessGate, ReadinessHandle,
};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument, Span};

use crate::error::NodeError;
use crate::paths::{NODE_STDERR_LOG, NODE_STDOUT_LOG};

/// Extra time a stop waits past the grace period for the SIGKILL to land.
const KILL_SLACK: Duration = Duration::from_secs(2);

/// State shared between the supervisor and its monitor task.
struct Shared {
    health: watch::Sender<NodeHealth>,
    gate: ReadinessGate,
}

impl Shared {
    fn publish(&self, update: impl FnOnce(&mut NodeHealth)) {
        self.health.send_modify(update);
        let health = self.health.borrow();
        info!(state = %health.state, pid = ?health.pid, "node health changed");
    }

    fn mark_running(&self) {
        self.publish(|h| h.state = NodeState::Running);
        self.gate.open();
    }

    fn mark_failed(&self, err: &NodeError) {
        warn!(error = %err, "node failed");
        let message = err.to_string();
        self.publish(|h| {
            h.state = NodeState::Failed;
            h.pid = None;
            h.last_error = Some(message);
        });
        self.gate.close();
    }

    fn mark_stopped(&self) {
        self.publish(|h| {
            if h.state != NodeState::Failed {
                h.state = NodeState::Stopped;
            }
            h.pid = None;
        });
        self.gate.close();
    }
}

struct Run {
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    run: Option<Run>,
}

/// Launches the storage node and keeps its health current.
///
/// One-shot: a supervisor starts at most once. Construct a new one to run the
/// node again.
pub struct NodeSupervisor {
    config: NodeConfig,
    log_dir: PathBuf,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    span: Span,
}

impl NodeSupervisor {
    /// `parent` scopes the supervisor: canceling it stops the node.
    pub fn new(config: NodeConfig, log_dir: impl Into<PathBuf>, parent: &CancellationToken) -> Self {
        let (health, _rx) = watch::channel(NodeHealth::default());
        Self {
            config,
            log_dir: log_dir.into(),
            cancel: parent.child_token(),
            shared: Arc::new(Shared {
                health,
                gate: ReadinessGate::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            span: tracing::info_span!("node"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn health(&self) -> NodeHealth {
        self.shared.health.borrow().clone()
    }

    pub fn state(&self) -> NodeState {
        self.shared.health.borrow().state
    }

    /// Receiver that observes every health change.
    pub fn subscribe(&self) -> watch::Receiver<NodeHealth> {
        self.shared.health.subscribe()
    }

    /// Spawn the node process.
    ///
    /// Returns once the process exists; readiness is signaled through
    /// [`AsyncComponent::wait_for_ready`]. Spawn failures are returned here and
    /// also recorded in the health snapshot.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return Err(NodeError::AlreadyStarted);
        }
        lifecycle.started = true;

        let _enter = self.span.enter();
        let child = match self.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.shared.mark_failed(&err);
                return Err(err);
            }
        };
        let pid = child.id();
        info!(binary = %self.config.binary.display(), pid = ?pid, "node spawned");

        let probe = self.config.ready_probe;
        self.shared.publish(|h| {
            h.state = if probe.is_some() {
                NodeState::Starting
            } else {
                NodeState::Running
            };
            h.pid = pid;
            h.started_at = Some(Utc::now());
            h.last_error = None;
        });
        if probe.is_none() {
            self.shared.gate.open();
        }

        let cancel = self.cancel.child_token();
        let monitor = tokio::spawn(
            monitor(
                child,
                Arc::clone(&self.shared),
                cancel.clone(),
                self.config.clone(),
            )
            .instrument(self.span.clone()),
        );
        lifecycle.run = Some(Run { cancel, monitor });
        Ok(())
    }

    fn spawn(&self) -> Result<Child, NodeError> {
        let stdout = open_log(&self.log_dir, NODE_STDOUT_LOG)?;
        let stderr = open_log(&self.log_dir, NODE_STDERR_LOG)?;

        let mut command = Command::new(&self.config.binary);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command.spawn().map_err(|source| NodeError::SpawnFailed {
            binary: self.config.binary.clone(),
            source,
        })
    }

    /// Stop the node: SIGTERM, then SIGKILL once the grace period runs out.
    ///
    /// Safe to call before `start`, while the node is still starting, and more
    /// than once. The lifecycle lock is held until the node is gone, so a
    /// concurrent caller returns only after the first stop has finished.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(run) = lifecycle.run.take() else {
            self.shared.gate.close();
            return Ok(());
        };

        run.cancel.cancel();
        let limit = self.config.stop_grace() + KILL_SLACK;
        let mut monitor = run.monitor;
        match tokio::time::timeout(limit, &mut monitor).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join)) => {
                warn!(parent: &self.span, error = %join, "node monitor task failed");
                self.shared.mark_stopped();
                Ok(())
            }
            Err(_) => {
                // Aborting drops the Child, and kill_on_drop reaps it.
                monitor.abort();
                self.shared.mark_stopped();
                Err(NodeError::StopTimeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

impl Component for NodeSupervisor {
    type Error = NodeError;

    async fn shutdown(&self) -> Result<(), NodeError> {
        self.stop().await
    }
}

impl AsyncComponent for NodeSupervisor {
    fn wait_for_ready(&self) -> ReadinessHandle {
        self.shared.gate.handle()
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

async fn monitor(mut child: Child, shared: Arc<Shared>, cancel: CancellationToken, config: NodeConfig) {
    let grace = config.stop_grace();

    if let Some(addr) = config.ready_probe {
        let timeout = config.ready_timeout();
        let interval = config.probe_interval();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child, grace).await;
                shared.mark_stopped();
                return;
            }
            status = child.wait() => {
                shared.mark_failed(&exited(status));
                return;
            }
            ready = probe_until_ready(addr, interval, timeout) => {
                if !ready {
                    terminate(&mut child, grace).await;
                    shared.mark_failed(&NodeError::ReadyTimeout {
                        timeout_ms: config.ready_timeout_ms,
                    });
                    return;
                }
                shared.mark_running();
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let status = terminate(&mut child, grace).await;
            info!(status = ?status, "node stopped");
            shared.mark_stopped();
        }
        status = child.wait() => {
            shared.mark_failed(&exited(status));
        }
    }
}

fn exited(status: std::io::Result<ExitStatus>) -> NodeError {
    let status = match status {
        Ok(status) => status.to_string(),
        Err(err) => format!("wait failed: {err}"),
    };
    NodeError::ExitedUnexpectedly { status }
}

/// Connect to `addr` every `interval` until it accepts or `timeout` elapses.
async fn probe_until_ready(addr: std::net::SocketAddr, interval: Duration, timeout: Duration) -> bool {
    let attempts = async {
        loop {
            if let Ok(Ok(_)) = tokio::time::timeout(interval, TcpStream::connect(addr)).await {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, attempts).await.is_ok()
}

async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                        return Some(status);
                    }
                    warn!(pid, grace_ms = grace.as_millis() as u64, "node ignored SIGTERM; killing");
                }
                Err(err) => warn!(pid, error = %err, "SIGTERM failed; killing"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.start_kill() {
        warn!(error = %err, "kill failed");
    }
    child.wait().await.ok()
}

fn open_log(dir: &Path, name: &str) -> Result<std::fs::File, NodeError> {
    let io = |source| NodeError::Io {
        path: dir.join(name),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(name))
        .map_err(io)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> NodeConfig {
        NodeConfig {
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            stop_grace_ms: 500,
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn start_without_probe_is_immediately_running() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let sup = NodeSupervisor::new(sh("sleep 30"), dir.path(), &root);

        sup.start().await.expect("start");
        sup.wait_for_ready().wait().await.expect("ready");
        let health = sup.health();
        assert_eq!(health.state, NodeState::Running);
        assert!(health.pid.is_some());
        assert!(health.started_at.is_some());

        sup.shutdown().await.expect("shutdown");
        assert_eq!(sup.state(), NodeState::Stopped);
        assert!(sup.health().pid.is_none());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let sup = NodeSupervisor::new(sh("sleep 30"), dir.path(), &root);
        sup.start().await.expect("start");
        assert!(matches!(sup.start().await, Err(NodeError::AlreadyStarted)));
        sup.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_closes_gate() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let config = NodeConfig {
            binary: dir.path().join("no-such-binary"),
            ..NodeConfig::default()
        };
        let sup = NodeSupervisor::new(config, dir.path(), &root);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, NodeError::SpawnFailed { .. }));
        let health = sup.health();
        assert_eq!(health.state, NodeState::Failed);
        assert!(health.last_error.is_some());
        assert!(sup.wait_for_ready().wait().await.is_err());
    }

    #[tokio::test]
    async fn unexpected_exit_marks_failed() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let sup = NodeSupervisor::new(sh("exit 3"), dir.path(), &root);
        let mut health = sup.subscribe();

        sup.start().await.expect("start");
        let failed = health
            .wait_for(|h| h.state == NodeState::Failed)
            .await
            .expect("health channel")
            .clone();
        assert!(failed
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("exited unexpectedly")));
        sup.shutdown().await.expect("shutdown");
        assert_eq!(sup.state(), NodeState::Failed, "stop keeps the failure visible");
    }

    #[tokio::test]
    async fn shutdown_before_ready_releases_waiters() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let config = NodeConfig {
            ready_probe: Some(addr),
            ready_timeout_ms: 60_000,
            ..sh("sleep 30")
        };
        let sup = NodeSupervisor::new(config, dir.path(), &root);

        sup.start().await.expect("start");
        assert_eq!(sup.state(), NodeState::Starting);
        let waiter = tokio::spawn(sup.wait_for_ready().wait());

        sup.shutdown().await.expect("shutdown");
        assert!(waiter.await.expect("join").is_err());
        assert_eq!(sup.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn probe_opens_gate_when_port_accepts() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let config = NodeConfig {
            ready_probe: Some(listener.local_addr().expect("addr")),
            probe_interval_ms: 20,
            ..sh("sleep 30")
        };
        let sup = NodeSupervisor::new(config, dir.path(), &root);

        sup.start().await.expect("start");
        sup.wait_for_ready().wait().await.expect("ready");
        assert_eq!(sup.state(), NodeState::Running);
        sup.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn sigterm_ignoring_node_is_killed_after_grace() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let config = NodeConfig {
            stop_grace_ms: 200,
            ..sh("trap '' TERM; sleep 30")
        };
        let sup = NodeSupervisor::new(config, dir.path(), &root);
        sup.start().await.expect("start");
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        sup.shutdown().await.expect("shutdown");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_stop_waits_for_the_node_to_exit() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let config = NodeConfig {
            stop_grace_ms: 300,
            ..sh("trap '' TERM; sleep 30")
        };
        let sup = Arc::new(NodeSupervisor::new(config, dir.path(), &root));
        sup.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let first = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.stop().await.expect("second stop");
        assert_eq!(sup.state(), NodeState::Stopped);
        assert_eq!(sup.health().pid, None);

        first.await.expect("join").expect("first stop");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_before_start() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let sup = NodeSupervisor::new(sh("sleep 30"), dir.path(), &root);
        sup.shutdown().await.expect("before start");
        sup.shutdown().await.expect("again");
        assert!(sup.wait_for_ready().wait().await.is_err());
    }

    #[tokio::test]
    async fn canceling_parent_stops_node() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let sup = NodeSupervisor::new(sh("sleep 30"), dir.path(), &root);
        let mut health = sup.subscribe();
        sup.start().await.expect("start");

        root.cancel();
        health
            .wait_for(|h| h.state == NodeState::Stopped)
            .await
            .expect("health channel");
        sup.shutdown().await.expect("shutdown after cancel");
    }

    #[tokio::test]
    async fn node_output_lands_in_log_files() {
        let dir = TempDir::new().expect("tempdir");
        let root = CancellationToken::new();
        let sup = NodeSupervisor::new(sh("echo out; echo err >&2; sleep 30"), dir.path(), &root);
        sup.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.shutdown().await.expect("shutdown");

        let out = std::fs::read_to_string(dir.path().join(NODE_STDOUT_LOG)).expect("stdout log");
        let err = std::fs::read_to_string(dir.path().join(NODE_STDERR_LOG)).expect("stderr log");
        assert!(out.contains("out"));
        assert!(err.contains("err"));
    }
}
