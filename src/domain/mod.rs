//! Domain types for the shellscribe orchestrator.
//!
//! This module contains the shared data model:
//! - Events: Immutable records of state changes
//! - Tasks: Targets, task specifications and policy decisions
//! - Findings and Artifacts: What modules discover and store
//! - Run: State reconstructed from events

pub mod artifact;
pub mod events;
pub mod finding;
pub mod run;
pub mod task;

// Re-export commonly used types
pub use artifact::{compute_checksum, Artifact};
pub use events::{Event, EventType, Provenance, RunId, TaskId};
pub use finding::{Confidence, Finding, Severity};
pub use run::{RunState, RunView, TaskRecord, TaskStatus};
pub use task::{Mapping, PolicyDecision, TargetProfile, TargetType, TaskSpec, Tier};
