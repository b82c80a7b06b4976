use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use spaced_core::config::{config_path_at, save_at, DaemonConfig, NodeConfig};
use spaced_daemon::paths::{node_stdout_log_path, pid_path};
use tempfile::TempDir;

fn spaced_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("spaced"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn config_init_creates_once() {
    let home = TempDir::new().expect("home");
    spaced_cmd(home.path())
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(contains("created"));
    assert!(config_path_at(home.path()).exists());

    spaced_cmd(home.path())
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(contains("already exists"));
}

#[test]
fn config_show_prints_defaults_without_file() {
    let home = TempDir::new().expect("home");
    spaced_cmd(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("binary: ipfs").and(contains("capacity: 1024")));
    assert!(!config_path_at(home.path()).exists());
}

#[test]
fn config_check_reports_invalid_field() {
    let home = TempDir::new().expect("home");
    let mut config = DaemonConfig::default_for(home.path());
    config.watcher.capacity = 0;
    save_at(home.path(), &config).expect("save");

    spaced_cmd(home.path())
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(contains("watcher.capacity"));
}

#[test]
fn config_check_rejects_malformed_yaml() {
    let home = TempDir::new().expect("home");
    let path = config_path_at(home.path());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "node: [not, a, map").unwrap();

    spaced_cmd(home.path())
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(contains("failed to load config"));
}

#[test]
fn status_and_stop_without_daemon() {
    let home = TempDir::new().expect("home");
    spaced_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
    spaced_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn logs_tail_last_lines() {
    let home = TempDir::new().expect("home");
    let log = node_stdout_log_path(home.path());
    fs::create_dir_all(log.parent().unwrap()).unwrap();
    fs::write(&log, "line1\nline2\nline3\nline4\n").unwrap();

    spaced_cmd(home.path())
        .args(["daemon", "logs", "--lines", "2"])
        .assert()
        .success()
        .stdout(
            contains("line3")
                .and(contains("line4"))
                .and(contains("line2").not())
                .and(contains("log file not found")),
        );
}

#[cfg(unix)]
#[test]
fn start_status_stop_round_trip() {
    let home = TempDir::new().expect("home");
    let mut config = DaemonConfig::default_for(home.path());
    config.node = NodeConfig {
        binary: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), "sleep 30".into()],
        stop_grace_ms: 500,
        ..NodeConfig::default()
    };
    save_at(home.path(), &config).expect("save");

    let mut daemon = spaced_cmd(home.path())
        .args(["daemon", "start"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn daemon");

    let started = Instant::now();
    while !pid_path(home.path()).exists() {
        assert!(
            started.elapsed() < Duration::from_secs(15),
            "daemon never wrote its pid file"
        );
        sleep(Duration::from_millis(50));
    }

    spaced_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": true"));

    spaced_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon stopped"));

    let status = daemon.wait().expect("daemon exit");
    assert!(status.success());
    assert!(!pid_path(home.path()).exists());
}
