//! `spaced config`: create, print, and validate the daemon config file.

use anyhow::{Context, Result};
use clap::Subcommand;

use spaced_core::config::{self, config_path_at};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write the default config if none exists yet.
    Init,
    /// Print the effective config (defaults when no file exists).
    Show,
    /// Load and validate the config file.
    Check,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    let home = config::home().context("could not determine home directory")?;
    let path = config_path_at(&home);

    match command {
        ConfigCommand::Init => {
            let (_, created) = config::init_at(&home).context("failed to initialize config")?;
            if created {
                println!("created {}", path.display());
            } else {
                println!("config already exists: {}", path.display());
            }
        }
        ConfigCommand::Show => {
            let config = config::load_at(&home).context("failed to load config")?;
            print!(
                "{}",
                serde_yaml::to_string(&config).context("failed to render config")?
            );
        }
        ConfigCommand::Check => {
            let config = config::load_at(&home).context("failed to load config")?;
            config
                .validate()
                .with_context(|| format!("{} is invalid", path.display()))?;
            println!("config ok: {}", path.display());
        }
    }
    Ok(())
}
