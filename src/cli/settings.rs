//! Project, config and policy subcommands.
//!
//! Provides commands to:
//! - `project init`: create `.shellscribe/` with a default config
//! - `config get|set`: read or edit dotted config keys
//! - `policy allowlist add|remove|list`: manage live-action targets

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config::{self, Config};

#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Create .shellscribe/ in the current directory
    Init,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print a config value (or the whole config)
    Get {
        /// Dotted key, e.g. storage.runs_dir
        key: Option<String>,
    },

    /// Set a config value; the value is parsed as YAML
    Set {
        /// Dotted key, e.g. dry_run
        key: String,

        /// New value, e.g. false, 8, "[high, critical]"
        value: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommands {
    /// Manage the target allowlist
    Allowlist {
        #[command(subcommand)]
        command: AllowlistCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum AllowlistCommands {
    /// Permit a target (exact string or glob pattern)
    Add { target: String },

    /// Remove a target entry
    Remove { target: String },

    /// Show the allowlist
    List,
}

pub fn execute_project(command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::Init => {
            let cwd = std::env::current_dir().context("Failed to determine current directory")?;
            let path = config::project_init(&cwd)?;
            println!("Initialized {}", path.display());
            Ok(())
        }
    }
}

pub fn execute_config(command: ConfigCommands) -> Result<()> {
    let resolved = config::load()?;

    match command {
        ConfigCommands::Get { key: None } => {
            print!("{}", serde_yaml::to_string(&resolved.config)?);
        }
        ConfigCommands::Get { key: Some(key) } => {
            let value = resolved.config.get(&key)?;
            print!("{}", serde_yaml::to_string(&value)?);
        }
        ConfigCommands::Set { key, value } => {
            let updated = resolved.config.with_value(&key, &value)?;
            let path = resolved.config_path();
            updated.save(&path)?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}

pub fn execute_policy(command: PolicyCommands) -> Result<()> {
    let PolicyCommands::Allowlist { command } = command;
    let resolved = config::load()?;
    let mut config: Config = resolved.config.clone();

    match command {
        AllowlistCommands::List => {
            if config.allowlist.is_empty() {
                println!("Allowlist is empty");
            }
            for entry in &config.allowlist {
                println!("{}", entry);
            }
            return Ok(());
        }
        AllowlistCommands::Add { target } => {
            if target.trim().is_empty() {
                anyhow::bail!("Allowlist entry cannot be empty");
            }
            if glob::Pattern::new(&target).is_err() {
                anyhow::bail!("Invalid glob pattern: {}", target);
            }
            if config.allowlist.contains(&target) {
                println!("{} is already allowlisted", target);
                return Ok(());
            }
            config.allowlist.push(target.clone());
            println!("Added {}", target);
        }
        AllowlistCommands::Remove { target } => {
            let before = config.allowlist.len();
            config.allowlist.retain(|entry| entry != &target);
            if config.allowlist.len() == before {
                anyhow::bail!("{} is not in the allowlist", target);
            }
            println!("Removed {}", target);
        }
    }

    config.save(&resolved.config_path())
}
