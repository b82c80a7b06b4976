//! `spaced daemon`: foreground run, stop by signal, status, and node logs.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use spaced_core::config;
use spaced_daemon::paths::{node_stderr_log_path, node_stdout_log_path};
use spaced_daemon::status::{read_status_at, running_pid_at, signal_stop};
use spaced_daemon::start_blocking;

/// How long `stop` waits for the daemon to remove its pid file.
const STOP_WAIT: Duration = Duration::from_secs(15);

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until SIGTERM or ctrl-c.
    Start,
    /// Send SIGTERM to the running daemon and wait for it to exit.
    Stop,
    /// Print the daemon's last status snapshot as JSON.
    Status,
    /// Print recent node log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only the node's stderr log.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = config::home().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => {
            if let Some(pid) = running_pid_at(&home).context("failed to read pid file")? {
                bail!("daemon is already running (pid {pid})");
            }
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => stop(&home)?,
        DaemonCommand::Status => status(&home)?,
        DaemonCommand::Logs(args) => {
            if !args.stderr_only {
                print_tail(&node_stdout_log_path(&home), args.lines)
                    .context("failed to read node stdout log")?;
            }
            print_tail(&node_stderr_log_path(&home), args.lines)
                .context("failed to read node stderr log")?;
        }
    }
    Ok(())
}

fn stop(home: &Path) -> Result<()> {
    let Some(pid) = running_pid_at(home).context("failed to read pid file")? else {
        println!("daemon is not running");
        return Ok(());
    };
    signal_stop(pid).context("failed to stop daemon")?;

    let started = Instant::now();
    while started.elapsed() < STOP_WAIT {
        if running_pid_at(home)?.is_none() {
            println!("daemon stopped (pid {pid})");
            return Ok(());
        }
        sleep(Duration::from_millis(100));
    }
    bail!("daemon (pid {pid}) did not exit within {}s", STOP_WAIT.as_secs())
}

fn status(home: &Path) -> Result<()> {
    let running = running_pid_at(home).context("failed to read pid file")?;
    let snapshot = read_status_at(home).context("failed to read status file")?;

    let payload = match (running, snapshot) {
        (Some(_), Some(snapshot)) => serde_json::to_value(&snapshot)?,
        (Some(pid), None) => serde_json::json!({ "running": true, "pid": pid }),
        (None, Some(mut snapshot)) => {
            // Last words of a daemon that is gone.
            snapshot.running = false;
            serde_json::to_value(&snapshot)?
        }
        (None, None) => serde_json::json!({ "running": false }),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to render daemon status JSON")?
    );
    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
