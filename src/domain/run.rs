//! Run state and reconstruction from events.
//!
//! A run's state is never stored directly: it is a fold over the run's
//! ordered events, so the event log alone is enough to rebuild it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{Event, EventType, RunId, TaskId};
use super::finding::Finding;
use super::task::{PolicyDecision, TargetProfile, TaskSpec};

/// Lifecycle state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// No run started yet
    Idle,

    /// Accepting and dispatching tasks
    Running,

    /// Holding a task until an approval signal arrives
    Paused { task_id: TaskId },

    /// Finished normally
    Completed,

    /// Stopped after an unrecoverable failure or an explicit abort
    Aborted { reason: String },
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused { .. } => "paused",
            Self::Completed => "completed",
            Self::Aborted { .. } => "aborted",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted { .. })
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Where a single task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Decided and handed to a worker
    Dispatched,
    AwaitingApproval,
    Denied,
    Executed,
    Skipped,
    Suppressed,
    Failed,
}

/// What the event history says about one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: TaskSpec,
    pub decision: PolicyDecision,
    pub status: TaskStatus,
}

/// A run reconstructed from its events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub id: RunId,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub targets: Vec<TargetProfile>,
    pub tasks: BTreeMap<TaskId, TaskRecord>,

    /// Recorded findings in publication order (superseded ones included)
    pub findings: Vec<Finding>,

    /// Modules excluded after a fault
    pub excluded_modules: BTreeSet<String>,

    /// Number of error-tagged events
    pub faults: usize,
}

impl RunView {
    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut view = Self {
            id: first.run_id,
            state: RunState::Idle,
            started_at: first.timestamp,
            finished_at: None,
            targets: Vec::new(),
            tasks: BTreeMap::new(),
            findings: Vec::new(),
            excluded_modules: BTreeSet::new(),
            faults: 0,
        };

        for event in events {
            view.apply_event(event);
        }

        Some(view)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        if event.is_error() {
            self.faults += 1;
        }

        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                self.targets = event.payload_field("targets").unwrap_or_default();
            }
            EventType::RunPaused => {
                if let Some(task_id) = event.task_id {
                    self.state = RunState::Paused { task_id };
                }
            }
            EventType::RunResumed => {
                self.state = RunState::Running;
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.finished_at = Some(event.timestamp);
            }
            EventType::RunAborted => {
                self.state = RunState::Aborted {
                    reason: event.payload_field("reason").unwrap_or_default(),
                };
                self.finished_at = Some(event.timestamp);
            }
            EventType::TaskProposed => {
                let (Some(task_id), Some(task), Some(decision)) = (
                    event.task_id,
                    event.payload_field::<TaskSpec>("task"),
                    event.payload_field::<PolicyDecision>("decision"),
                ) else {
                    return;
                };
                let status = if !decision.allowed {
                    TaskStatus::Denied
                } else if decision.requires_approval {
                    TaskStatus::AwaitingApproval
                } else {
                    TaskStatus::Dispatched
                };
                self.tasks.insert(
                    task_id,
                    TaskRecord {
                        task,
                        decision,
                        status,
                    },
                );
            }
            EventType::TaskApproved => self.set_task_status(event, TaskStatus::Dispatched),
            EventType::TaskDenied => self.set_task_status(event, TaskStatus::Denied),
            EventType::TaskExecuted => self.set_task_status(event, TaskStatus::Executed),
            EventType::TaskSkipped => self.set_task_status(event, TaskStatus::Skipped),
            EventType::TaskSuppressed => self.set_task_status(event, TaskStatus::Suppressed),
            EventType::FindingRecorded => {
                if let Some(finding) = event.payload_field::<Finding>("finding") {
                    self.findings.push(finding);
                }
            }
            EventType::ModuleFault => {
                if let Some(module) = event.provenance.module.clone() {
                    self.excluded_modules.insert(module);
                }
                if event.payload_field::<String>("phase").as_deref() == Some("handle_task") {
                    self.set_task_status(event, TaskStatus::Failed);
                }
            }
            EventType::TaskAwaitingApproval
            | EventType::ModuleEmitted
            | EventType::FindingRejected
            | EventType::ArtifactStored
            | EventType::HandlerFault => {}
        }
    }

    fn set_task_status(&mut self, event: &Event, status: TaskStatus) {
        if let Some(record) = event.task_id.and_then(|id| self.tasks.get_mut(&id)) {
            record.status = status;
        }
    }

    /// Latest version of each finding, ordered by first appearance
    pub fn current_findings(&self) -> Vec<Finding> {
        let mut order: Vec<String> = Vec::new();
        let mut latest: BTreeMap<String, Finding> = BTreeMap::new();
        for finding in &self.findings {
            if !latest.contains_key(&finding.id) {
                order.push(finding.id.clone());
            }
            latest.insert(finding.id.clone(), finding.clone());
        }
        order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect()
    }

    /// Target identifiers across all of the run's profiles
    pub fn target_identifiers(&self) -> BTreeSet<String> {
        self.targets.iter().flat_map(|t| t.identifiers()).collect()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|r| r.status == status).count()
    }
}
