//! Modules: the units of work the orchestrator dispatches tasks to.
//!
//! The orchestrator only knows the capability set of [`Module`]. Concrete
//! modules are registered in a [`ModuleRegistry`] and resolved by name once,
//! when a run starts.

pub mod scripted;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Artifact, Event, EventType, Finding, RunId, TargetProfile, TaskId, TaskSpec};
use crate::inference::InferenceBackend;
use crate::plugins::PluginRegistry;

pub use scripted::ScriptedModule;

/// Run-scoped context handed to [`Module::initialize`]
#[derive(Clone)]
pub struct ModuleContext {
    pub run_id: RunId,
    pub targets: Vec<TargetProfile>,
    pub dry_run: bool,
    pub offline: bool,

    /// Language-model backend, when one is configured
    pub inference: Option<Arc<dyn InferenceBackend>>,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("run_id", &self.run_id)
            .field("targets", &self.targets.len())
            .field("dry_run", &self.dry_run)
            .field("offline", &self.offline)
            .field("inference", &self.inference.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

/// Per-task context handed to [`Module::handle_task`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub run_id: RunId,
    pub task_id: TaskId,

    /// Policy permits only simulated execution
    pub simulate: bool,
}

/// Something a module produced while handling a task
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Module-defined event, re-published as `ModuleEmitted`
    Event {
        kind: String,
        data: serde_json::Value,
    },

    /// Re-published as `FindingRecorded` after the target cross-check
    Finding(Finding),

    /// Stored in the artifact store, then re-published as `ArtifactStored`
    Artifact { artifact: Artifact, content: Vec<u8> },
}

impl Emission {
    pub fn event(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Event {
            kind: kind.into(),
            data,
        }
    }
}

/// Failure of [`Module::initialize`]; aborts the run
#[derive(Debug, Clone, Error)]
#[error("Module '{module}' failed to initialize: {reason}")]
pub struct ModuleInitError {
    pub module: String,
    pub reason: String,
}

impl ModuleInitError {
    pub fn new(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

/// A unit of productive work
#[async_trait]
pub trait Module: Send + Sync {
    /// Name tasks use to address this module
    fn name(&self) -> &str;

    /// Event types delivered to [`Module::on_event`]
    fn subscriptions(&self) -> Vec<EventType> {
        Vec::new()
    }

    /// One-time setup at run start
    async fn initialize(&self, _ctx: &ModuleContext) -> Result<(), ModuleInitError> {
        Ok(())
    }

    /// React to an event another actor published. Errors exclude the module
    /// from the rest of the run.
    fn on_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Execute a task, producing an ordered, finite list of emissions
    async fn handle_task(&self, task: &TaskSpec, ctx: &TaskContext) -> Result<Vec<Emission>>;
}

/// Live module instances by name
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.modules.keys()).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under its own name, replacing any previous one
    pub fn register(&mut self, module: impl Module + 'static) -> &mut Self {
        self.register_arc(Arc::new(module))
    }

    pub fn register_arc(&mut self, module: Arc<dyn Module>) -> &mut Self {
        self.modules.insert(module.name().to_string(), module);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules allowed to run given the plugin registry. With no manifests
    /// registered every module is available; otherwise only modules with an
    /// enabled manifest are.
    pub fn resolve(&self, plugins: &PluginRegistry) -> ModuleRegistry {
        if plugins.list().is_empty() {
            return self.clone();
        }
        let modules = self
            .modules
            .iter()
            .filter(|(name, _)| plugins.get(name).map_or(false, |m| m.enabled))
            .map(|(name, module)| (name.clone(), module.clone()))
            .collect();
        ModuleRegistry { modules }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Module>)> {
        self.modules.iter()
    }
}
