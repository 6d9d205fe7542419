//! Scenario definitions and loading.
//!
//! A scenario describes one run in YAML: the targets it is about and the
//! tasks to submit, in order.
//!
//! ```yaml
//! name: perimeter
//! description: Enumerate the edge hosts
//! targets:
//!   - target_type: host
//!     inputs: { target: 10.0.0.5 }
//! tasks:
//!   - module: recon
//!     objective: enumerate
//!     policy_context: { target: 10.0.0.5, tier: low }
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{TargetProfile, TaskSpec};

/// A complete scenario definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name (used in logs)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Targets of the run
    #[serde(default)]
    pub targets: Vec<TargetProfile>,

    /// Tasks submitted in order
    pub tasks: Vec<TaskSpec>,
}

impl Scenario {
    /// Load a scenario from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a scenario from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse scenario YAML")
    }

    /// Validate the scenario definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Scenario name cannot be empty");
        }

        if self.tasks.is_empty() {
            anyhow::bail!("Scenario must have at least one task");
        }

        for (i, target) in self.targets.iter().enumerate() {
            if target.identifiers().is_empty() {
                anyhow::bail!("Target {} names no identifier (inputs.target or inputs.targets)", i);
            }
        }

        for (i, task) in self.tasks.iter().enumerate() {
            if task.module.trim().is_empty() {
                anyhow::bail!("Task {} has an empty module name", i);
            }
        }

        Ok(())
    }

    /// Modules the scenario addresses
    pub fn modules(&self) -> BTreeSet<&str> {
        self.tasks.iter().map(|t| t.module.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIMETER: &str = r#"
name: perimeter
description: Enumerate the edge hosts
targets:
  - target_type: host
    inputs:
      targets: [10.0.0.5, 10.0.0.6]
tasks:
  - module: recon
    objective: enumerate
    policy_context:
      target: 10.0.0.5
      tier: low
  - module: web
    objective: crawl
    params:
      depth: 2
    policy_context:
      target: 10.0.0.6
"#;

    #[test]
    fn test_scenario_parsing() {
        let scenario = Scenario::from_yaml(PERIMETER).unwrap();
        assert_eq!(scenario.name, "perimeter");
        assert_eq!(scenario.targets[0].identifiers(), vec!["10.0.0.5", "10.0.0.6"]);
        assert_eq!(scenario.tasks.len(), 2);
        assert_eq!(scenario.tasks[0].target(), Some("10.0.0.5"));
        assert_eq!(scenario.tasks[1].params["depth"], 2);
        assert_eq!(scenario.modules().into_iter().collect::<Vec<_>>(), vec!["recon", "web"]);
        scenario.validate().unwrap();
    }

    #[test]
    fn test_scenario_validation() {
        let scenario = Scenario::from_yaml("name: empty\ntasks: []\n").unwrap();
        assert!(scenario.validate().is_err());

        let scenario = Scenario::from_yaml(
            "name: bad\ntargets:\n  - target_type: host\ntasks:\n  - module: recon\n    objective: x\n",
        )
        .unwrap();
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("perimeter.yaml");
        std::fs::write(&path, PERIMETER).unwrap();

        assert_eq!(Scenario::from_file(&path).unwrap().name, "perimeter");
        assert!(Scenario::from_file(&temp.path().join("missing.yaml")).is_err());
    }
}
