//! A module that replays emissions described in the task itself.
//!
//! Scenarios use it to exercise the dispatch path without touching a live
//! target: `params.emit` lists what the module should produce, in order.
//!
//! ```yaml
//! params:
//!   emit:
//!     - type: event
//!       kind: port_open
//!       data: { port: 22 }
//!     - type: finding
//!       id: F-1
//!       title: SSH exposed
//!       severity: low
//!       confidence: high
//!       targets: [10.0.0.5]
//!     - type: artifact
//!       path: banners/ssh.txt
//!       content: SSH-2.0-OpenSSH_9.6
//!     - type: fail
//!       message: connection reset
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{Artifact, Finding, TaskSpec};

use super::{Emission, Module, TaskContext};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ScriptStep {
    Event {
        kind: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    Finding(Finding),
    Artifact {
        path: String,
        content: String,
        #[serde(default)]
        mime: Option<String>,
    },
    Fail {
        message: String,
    },
}

/// Emits whatever `params.emit` describes
#[derive(Debug, Clone)]
pub struct ScriptedModule {
    name: String,
}

impl ScriptedModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Module for ScriptedModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_task(&self, task: &TaskSpec, ctx: &TaskContext) -> Result<Vec<Emission>> {
        let Some(script) = task.params.get("emit") else {
            return Ok(Vec::new());
        };

        let steps: Vec<ScriptStep> = serde_json::from_value(script.clone())
            .with_context(|| format!("Invalid emit script for module '{}'", self.name))?;

        debug!(module = %self.name, steps = steps.len(), simulate = ctx.simulate, "Running script");

        let mut emissions = Vec::with_capacity(steps.len());
        for step in steps {
            match step {
                ScriptStep::Event { kind, data } => emissions.push(Emission::event(kind, data)),
                ScriptStep::Finding(finding) => emissions.push(Emission::Finding(finding)),
                ScriptStep::Artifact {
                    path,
                    content,
                    mime,
                } => {
                    let mut artifact =
                        Artifact::from_bytes(path, content.as_bytes()).with_source(self.name.clone());
                    artifact.mime = mime;
                    emissions.push(Emission::Artifact {
                        artifact,
                        content: content.into_bytes(),
                    });
                }
                ScriptStep::Fail { message } => anyhow::bail!(message),
            }
        }

        Ok(emissions)
    }
}
