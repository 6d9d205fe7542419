//! shellscribe - policy-gated, event-sourced orchestrator for security
//! assessment tasks
//!
//! Every task a module wants to perform is evaluated by a policy engine
//! before anything runs, and every state transition is recorded as an
//! immutable event that can be replayed later.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable events
//! - Current state is derived by replaying events
//! - Replay never dispatches modules or writes anything
//!
//! # Modules
//!
//! - `domain`: Data structures (Event, TaskSpec, Finding, Artifact, RunView)
//! - `core`: PolicyEngine, EventBus, Orchestrator, replay, scenarios
//! - `modules`: The Module capability interface and built-in modules
//! - `storage`: Event log, findings store, artifact store
//! - `inference`: Language-model backends
//! - `plugins`: Plugin manifests and registry
//! - `config`: Configuration loading
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! shellscribe project init
//! shellscribe policy allowlist add 10.0.0.5
//! shellscribe run scenarios/perimeter.yaml
//! shellscribe report <run-id>
//! shellscribe replay <run-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod inference;
pub mod modules;
pub mod plugins;
pub mod storage;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorError, PolicyConfig, PolicyEngine};
pub use domain::{Event, EventType, Finding, RunState, RunView, TargetProfile, TaskSpec};
pub use modules::{Emission, Module};
