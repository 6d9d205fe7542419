//! Plugin manifests and the registry that enables or disables them.
//!
//! The registry is persisted as `.shellscribe/plugins.yaml`. Manifests feed
//! the policy engine's tier rules; the module registry resolves enabled
//! manifest names to live module instances.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{Mapping, TargetType, Tier};

/// Declared identity and risk of a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,

    pub version: String,

    pub tier: Tier,

    /// Target kinds the module supports (empty means any)
    #[serde(default)]
    pub targets: Vec<TargetType>,

    /// Module-specific policy hints
    #[serde(default)]
    pub policies: Mapping,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl PluginManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>, tier: Tier) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tier,
            targets: Vec::new(),
            policies: Mapping::new(),
            enabled: default_enabled(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    plugins: Vec<PluginManifest>,
}

/// Known plugin manifests
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    path: Option<PathBuf>,
    plugins: Vec<PluginManifest>,
}

impl PluginRegistry {
    /// Create an in-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the registry file; a missing file yields an empty registry
    pub fn load(path: &Path) -> Result<Self> {
        let plugins = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read plugin registry: {}", path.display()))?;
            let file: RegistryFile = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse plugin registry: {}", path.display()))?;
            file.plugins
        } else {
            Vec::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            plugins,
        })
    }

    /// Write the registry back to the file it was loaded from
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .context("Plugin registry was not loaded from a file")?;
        let file = RegistryFile {
            plugins: self.plugins.clone(),
        };
        let content = serde_yaml::to_string(&file).context("Failed to serialize plugin registry")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plugin registry: {}", path.display()))
    }

    /// Add a manifest, replacing any with the same name
    pub fn register(&mut self, manifest: PluginManifest) {
        if let Some(existing) = self.plugins.iter_mut().find(|p| p.name == manifest.name) {
            *existing = manifest;
        } else {
            self.plugins.push(manifest);
        }
    }

    pub fn list(&self) -> &[PluginManifest] {
        &self.plugins
    }

    pub fn get(&self, name: &str) -> Option<&PluginManifest> {
        self.plugins.iter().find(|p| p.name == name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PluginManifest> {
        self.plugins.iter().filter(|p| p.enabled)
    }

    /// Enable or disable a plugin by name
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let plugin = self
            .plugins
            .iter_mut()
            .find(|p| p.name == name)
            .with_context(|| format!("Plugin '{}' is not registered", name))?;
        plugin.enabled = enabled;
        Ok(())
    }
}
