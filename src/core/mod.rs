//! Core orchestration logic.
//!
//! This module contains:
//! - PolicyEngine: decides whether a task may run
//! - EventBus: synchronous fan-out of published events
//! - Orchestrator: run lifecycle and task dispatch
//! - Replay: read-only reconstruction of persisted runs
//! - Scenario: YAML run definitions
//! - RetryPolicy: bounded retries for persistence

pub mod event_bus;
pub mod orchestrator;
pub mod policy;
pub mod replay;
pub mod retry;
pub mod scenario;

// Re-export commonly used types
pub use event_bus::{EventBus, EventBusBuilder, EventHandler, HandlerFailure};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorError, RunEvents};
pub use policy::{reasons, PolicyConfig, PolicyEngine};
pub use replay::{replay, replay_events, ReplayError, ReplayOutcome};
pub use retry::RetryPolicy;
pub use scenario::Scenario;
