//! Read-only replay of a persisted run.
//!
//! Replay folds a run's events through [`RunView`] without dispatching
//! modules or writing anything, and checks that the history is consistent:
//! every event belongs to the run, `seq` strictly increases, and no task was
//! executed without an allowing (and, where required, approved) decision.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::domain::{Event, EventType, Finding, PolicyDecision, RunId, RunState, RunView, TaskId};
use crate::storage::{EventLog, StorageError};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Run {0} not found")]
    NotFound(RunId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Event {event_id} belongs to run {found}, expected {expected}")]
    ForeignEvent {
        event_id: uuid::Uuid,
        expected: RunId,
        found: RunId,
    },

    #[error("Sequence not increasing at event {event_id}: {seq} after {previous}")]
    OutOfOrder {
        event_id: uuid::Uuid,
        previous: u64,
        seq: u64,
    },

    #[error("Task {task_id} was executed without permission: {detail}")]
    SafetyViolation { task_id: TaskId, detail: String },
}

/// Everything a replay reconstructs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayOutcome {
    pub run_id: RunId,
    pub events: Vec<Event>,

    /// Latest version of each recorded finding
    pub findings: Vec<Finding>,

    pub state: RunState,
    pub view: RunView,
}

impl ReplayOutcome {
    /// Stable serialized form; identical for identical histories
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Replay a run from the event log
#[instrument(skip(log))]
pub async fn replay(log: &dyn EventLog, run_id: RunId) -> Result<ReplayOutcome, ReplayError> {
    let events = log.read_all(run_id).await?;
    debug!(events = events.len(), "Replaying run");
    replay_events(run_id, events)
}

/// Replay an already-loaded history
pub fn replay_events(run_id: RunId, events: Vec<Event>) -> Result<ReplayOutcome, ReplayError> {
    let mut previous_seq: Option<u64> = None;
    let mut decisions: HashMap<TaskId, PolicyDecision> = HashMap::new();
    let mut approved: HashSet<TaskId> = HashSet::new();

    for event in &events {
        if event.run_id != run_id {
            return Err(ReplayError::ForeignEvent {
                event_id: event.id,
                expected: run_id,
                found: event.run_id,
            });
        }

        if let Some(previous) = previous_seq {
            if event.seq <= previous {
                return Err(ReplayError::OutOfOrder {
                    event_id: event.id,
                    previous,
                    seq: event.seq,
                });
            }
        }
        previous_seq = Some(event.seq);

        check_permission(event, &mut decisions, &mut approved)?;
    }

    let view = RunView::from_events(&events).ok_or(ReplayError::NotFound(run_id))?;

    Ok(ReplayOutcome {
        run_id,
        findings: view.current_findings(),
        state: view.state.clone(),
        view,
        events,
    })
}

fn check_permission(
    event: &Event,
    decisions: &mut HashMap<TaskId, PolicyDecision>,
    approved: &mut HashSet<TaskId>,
) -> Result<(), ReplayError> {
    let Some(task_id) = event.task_id else {
        return Ok(());
    };

    match event.event_type {
        EventType::TaskProposed => {
            if let Some(decision) = event.payload_field::<PolicyDecision>("decision") {
                decisions.insert(task_id, decision);
            }
        }
        EventType::TaskApproved => {
            approved.insert(task_id);
        }
        EventType::TaskExecuted => {
            let violation = |detail: &str| ReplayError::SafetyViolation {
                task_id,
                detail: detail.to_string(),
            };
            let decision = decisions
                .get(&task_id)
                .ok_or_else(|| violation("no policy decision recorded"))?;
            if !decision.allowed {
                return Err(violation(&format!("denied ({})", decision.reason)));
            }
            if decision.requires_approval && !approved.contains(&task_id) {
                return Err(violation("approval required but never given"));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSpec;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn history(run_id: RunId, decision: PolicyDecision, approve: bool) -> Vec<Event> {
        let task_id = Uuid::new_v4();
        let task = TaskSpec::new("recon", "enumerate").with_context("target", "10.0.0.5");
        let mut events = vec![
            Event::new(run_id, EventType::RunStarted, json!({"targets": []})),
            Event::new(
                run_id,
                EventType::TaskProposed,
                json!({"task": task, "decision": decision}),
            )
            .with_task(task_id),
        ];
        if approve {
            events.push(Event::new(run_id, EventType::TaskApproved, json!({})).with_task(task_id));
        }
        events.push(Event::new(run_id, EventType::TaskExecuted, json!({})).with_task(task_id));

        let now = Utc::now();
        events
            .into_iter()
            .enumerate()
            .map(|(i, e)| e.stamped(i as u64 + 1, now))
            .collect()
    }

    #[test]
    fn test_allowed_history_replays() {
        let run_id = Uuid::new_v4();
        let outcome = replay_events(run_id, history(run_id, PolicyDecision::allow(), false)).unwrap();
        assert_eq!(outcome.events.len(), 3);
        assert_eq!(outcome.state, RunState::Running);
    }

    #[test]
    fn test_denied_execution_is_a_violation() {
        let run_id = Uuid::new_v4();
        let err = replay_events(
            run_id,
            history(run_id, PolicyDecision::deny("target_not_allowlisted"), false),
        )
        .unwrap_err();
        assert!(matches!(err, ReplayError::SafetyViolation { .. }));
    }

    #[test]
    fn test_unapproved_execution_is_a_violation() {
        let run_id = Uuid::new_v4();
        let decision = PolicyDecision::allow().with_approval(true);

        assert!(replay_events(run_id, history(run_id, decision.clone(), false)).is_err());
        assert!(replay_events(run_id, history(run_id, decision, true)).is_ok());
    }

    #[test]
    fn test_sequence_must_increase() {
        let run_id = Uuid::new_v4();
        let mut events = history(run_id, PolicyDecision::allow(), false);
        events[2].seq = 1;

        let err = replay_events(run_id, events).unwrap_err();
        assert!(matches!(err, ReplayError::OutOfOrder { previous: 2, seq: 1, .. }));
    }

    #[test]
    fn test_foreign_event_rejected() {
        let run_id = Uuid::new_v4();
        let events = history(Uuid::new_v4(), PolicyDecision::allow(), false);
        assert!(matches!(
            replay_events(run_id, events),
            Err(ReplayError::ForeignEvent { .. })
        ));
    }

    #[test]
    fn test_empty_history_not_found() {
        let run_id = Uuid::new_v4();
        assert!(matches!(
            replay_events(run_id, Vec::new()),
            Err(ReplayError::NotFound(_))
        ));
    }
}
