//! Plugin registry subcommands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config;
use crate::plugins::{PluginManifest, PluginRegistry};

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// List registered plugins
    List,

    /// Enable a registered plugin
    Enable { name: String },

    /// Disable a registered plugin
    Disable { name: String },

    /// Register (or replace) a plugin from a manifest file
    Register {
        /// YAML manifest: name, version, tier, targets, policies
        manifest: PathBuf,
    },
}

pub fn execute(command: PluginCommands) -> Result<()> {
    let resolved = config::load()?;
    let mut registry = PluginRegistry::load(&resolved.plugins_path())?;

    match command {
        PluginCommands::List => {
            if registry.list().is_empty() {
                println!("No plugins registered");
                return Ok(());
            }

            println!("{:<20} {:<10} {:<10} {:<8} {}", "NAME", "VERSION", "TIER", "ENABLED", "TARGETS");
            println!("{}", "-".repeat(70));
            for plugin in registry.list() {
                let targets: Vec<&str> = plugin.targets.iter().map(|t| t.as_str()).collect();
                println!(
                    "{:<20} {:<10} {:<10} {:<8} {}",
                    plugin.name,
                    plugin.version,
                    plugin.tier,
                    if plugin.enabled { "yes" } else { "no" },
                    if targets.is_empty() { "any".to_string() } else { targets.join(",") }
                );
            }
            return Ok(());
        }
        PluginCommands::Enable { name } => {
            registry.set_enabled(&name, true)?;
            println!("Enabled {}", name);
        }
        PluginCommands::Disable { name } => {
            registry.set_enabled(&name, false)?;
            println!("Disabled {}", name);
        }
        PluginCommands::Register { manifest } => {
            let content = std::fs::read_to_string(&manifest)
                .with_context(|| format!("Failed to read manifest: {}", manifest.display()))?;
            let plugin: PluginManifest = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse manifest: {}", manifest.display()))?;
            if plugin.name.trim().is_empty() {
                anyhow::bail!("Manifest has an empty name");
            }
            println!("Registered {} {} ({})", plugin.name, plugin.version, plugin.tier);
            registry.register(plugin);
        }
    }

    registry.save()
}
