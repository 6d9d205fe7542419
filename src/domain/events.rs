//! Event types for the event-sourced orchestrator.
//!
//! Every state transition of a run is recorded as an immutable event in an
//! append-only log. The ordered events of a run are its complete history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a run
pub type RunId = Uuid;

/// Identifies a submitted task within a run
pub type TaskId = Uuid;

/// A single event in the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Position of the event within its run (assigned at publish time)
    pub seq: u64,

    /// When this event was published (non-decreasing within a run)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: RunId,

    /// Type of event
    pub event_type: EventType,

    /// Task this event is about (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// Event body, shape determined by `event_type`
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Who produced the event
    pub provenance: Provenance,

    /// Error message for error-tagged events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create an unpublished event. Sequence and timestamp are reassigned by
    /// the orchestrator when the event is published.
    pub fn new(run_id: RunId, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            timestamp: Utc::now(),
            run_id,
            event_type,
            task_id: None,
            payload,
            provenance: Provenance::orchestrator(),
            error: None,
        }
    }

    /// Attach the task this event is about
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attach provenance
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Tag the event as an error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Assign publication order
    pub(crate) fn stamped(mut self, seq: u64, timestamp: DateTime<Utc>) -> Self {
        self.seq = seq;
        self.timestamp = timestamp;
        self
    }

    /// Whether this event records a failure
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Decode a single payload field
    pub fn payload_field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.payload
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Which actor produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// "orchestrator", "module" or "operator"
    pub actor: String,

    /// Module name when a module produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl Provenance {
    pub fn orchestrator() -> Self {
        Self {
            actor: "orchestrator".to_string(),
            module: None,
        }
    }

    pub fn module(name: impl Into<String>) -> Self {
        Self {
            actor: "module".to_string(),
            module: Some(name.into()),
        }
    }

    /// The human or driver that issued an approval signal
    pub fn operator() -> Self {
        Self {
            actor: "operator".to_string(),
            module: None,
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run has started
    RunStarted,

    /// The run is waiting on an approval signal
    RunPaused,

    /// An approval signal resumed the run
    RunResumed,

    /// The run completed
    RunCompleted,

    /// The run was aborted
    RunAborted,

    /// A task was evaluated by the policy engine (decision embedded)
    TaskProposed,

    /// A task is held until an approval signal arrives
    TaskAwaitingApproval,

    /// A held task was approved
    TaskApproved,

    /// A task was denied by policy or by the approver
    TaskDenied,

    /// A module finished executing a task
    TaskExecuted,

    /// An allowed task was not dispatched (module excluded)
    TaskSkipped,

    /// A task finished after the run was aborted; its output was discarded
    TaskSuppressed,

    /// A module-defined event re-published by the orchestrator
    ModuleEmitted,

    /// A finding was recorded
    FindingRecorded,

    /// A finding failed the target cross-check
    FindingRejected,

    /// An artifact was stored
    ArtifactStored,

    /// A module failed during initialize, handle_task or on_event
    ModuleFault,

    /// An event bus handler failed
    HandlerFault,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunPaused => "run_paused",
            Self::RunResumed => "run_resumed",
            Self::RunCompleted => "run_completed",
            Self::RunAborted => "run_aborted",
            Self::TaskProposed => "task_proposed",
            Self::TaskAwaitingApproval => "task_awaiting_approval",
            Self::TaskApproved => "task_approved",
            Self::TaskDenied => "task_denied",
            Self::TaskExecuted => "task_executed",
            Self::TaskSkipped => "task_skipped",
            Self::TaskSuppressed => "task_suppressed",
            Self::ModuleEmitted => "module_emitted",
            Self::FindingRecorded => "finding_recorded",
            Self::FindingRejected => "finding_rejected",
            Self::ArtifactStored => "artifact_stored",
            Self::ModuleFault => "module_fault",
            Self::HandlerFault => "handler_fault",
        }
    }

    /// Events after which a run accepts no further work
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunAborted)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            EventType::TaskProposed,
            json!({"decision": {"allowed": true}}),
        )
        .with_task(Uuid::new_v4());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"task_proposed\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_with_error() {
        let event = Event::new(Uuid::new_v4(), EventType::ModuleFault, json!({}))
            .with_provenance(Provenance::module("recon"))
            .with_error("connection reset");

        assert!(event.is_error());
        assert_eq!(event.provenance.module.as_deref(), Some("recon"));
    }

    #[test]
    fn test_payload_field() {
        let event = Event::new(
            Uuid::new_v4(),
            EventType::TaskDenied,
            json!({"reason": "target_not_allowlisted"}),
        );

        let reason: Option<String> = event.payload_field("reason");
        assert_eq!(reason.as_deref(), Some("target_not_allowlisted"));
        assert_eq!(event.payload_field::<String>("missing"), None);
    }
}
