//! End-to-end daemon runs with `/bin/sh` standing in for the storage node.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use spaced_cache::DataSource;
use spaced_core::config::{DaemonConfig, NodeConfig};
use spaced_core::{AsyncComponent, Caller, DirEntry, NodeState, RequestContext};
use spaced_daemon::paths::{pid_path, status_path};
use spaced_daemon::status::read_status_at;
use spaced_daemon::{Daemon, DaemonError, NodeError};
use tempfile::TempDir;

fn config(home: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::default_for(home);
    config.node = NodeConfig {
        binary: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), "sleep 30".into()],
        stop_grace_ms: 500,
        ..NodeConfig::default()
    };
    config
}

/// Poll `root`'s listing until `done` holds, for at most ten seconds.
async fn listing_until(
    daemon: &Daemon,
    ctx: &RequestContext,
    root: &Path,
    done: impl Fn(&[DirEntry]) -> bool,
) -> Result<Vec<DirEntry>, tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let children = daemon.cache().get_children(ctx, root).await.expect("list");
            if done(&children) {
                return children;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
}

#[tokio::test]
async fn start_serve_and_shutdown() {
    let home = TempDir::new().unwrap();
    let daemon = Daemon::start(home.path(), config(home.path()))
        .await
        .expect("start");
    daemon
        .supervisor()
        .wait_for_ready()
        .wait()
        .await
        .expect("node ready");

    let pid = std::fs::read_to_string(pid_path(home.path())).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());

    let root = daemon.watcher().roots()[0].clone();
    let ctx = RequestContext::new(Caller::Master);
    assert!(daemon
        .cache()
        .get_children(&ctx, &root)
        .await
        .expect("list")
        .is_empty());

    let file = root.join("hello.txt");
    std::fs::write(&file, b"hi").unwrap();
    let listed = listing_until(&daemon, &ctx, &root, |children| !children.is_empty())
        .await
        .expect("watcher never reported the create");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "hello.txt");

    std::fs::remove_file(&file).unwrap();
    listing_until(&daemon, &ctx, &root, |children| children.is_empty())
        .await
        .expect("watcher never reported the delete");

    daemon.shutdown().await.expect("shutdown");
    assert!(!pid_path(home.path()).exists());
    let status = read_status_at(home.path()).unwrap().expect("final status");
    assert!(!status.running);
    assert_eq!(status.node.state, NodeState::Stopped);
}

#[tokio::test]
async fn status_file_is_written_while_running() {
    let home = TempDir::new().unwrap();
    let daemon = Daemon::start(home.path(), config(home.path()))
        .await
        .expect("start");

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(status)) = read_status_at(home.path()) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("status file");
    assert!(status.running);
    assert_eq!(status.pid, std::process::id());
    assert!(status_path(home.path()).exists());

    daemon.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn second_daemon_in_same_home_is_refused() {
    let home = TempDir::new().unwrap();
    let daemon = Daemon::start(home.path(), config(home.path()))
        .await
        .expect("start");

    let err = Daemon::start(home.path(), config(home.path()))
        .await
        .err()
        .expect("second start refused");
    assert!(matches!(err, DaemonError::AlreadyRunning { .. }));

    daemon.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn node_spawn_failure_aborts_startup() {
    let home = TempDir::new().unwrap();
    let mut config = config(home.path());
    config.node.binary = home.path().join("missing-node");

    let err = Daemon::start(home.path(), config)
        .await
        .err()
        .expect("start fails");
    assert!(matches!(
        err,
        DaemonError::Node(NodeError::SpawnFailed { .. })
    ));
    assert!(!pid_path(home.path()).exists());
}

#[tokio::test]
async fn run_until_returns_after_shutdown_future() {
    let home = TempDir::new().unwrap();
    spaced_daemon::run_until(
        home.path().to_path_buf(),
        config(home.path()),
        tokio::time::sleep(Duration::from_millis(200)),
    )
    .await
    .expect("run");
    assert!(!pid_path(home.path()).exists());
}
