//! spaced: local file-space daemon control.
//!
//! # Usage
//!
//! ```text
//! spaced daemon start|stop|status|logs
//! spaced config init|show|check
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config::ConfigCommand, daemon::DaemonCommand};

#[derive(Parser, Debug)]
#[command(
    name = "spaced",
    version,
    about = "Supervise the storage node and serve the local file space",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run, stop, and inspect the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Create, print, and validate `~/.spaced/config.yaml`.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Config { command } => commands::config::run(command),
    }
}
