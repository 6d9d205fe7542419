//! Replay Integration Tests
//!
//! Tests that persisted runs replay deterministically, without side effects,
//! and that tampered histories are detected.

use std::sync::Arc;

use serde_json::json;
use shellscribe::core::{replay, replay_events, Orchestrator, PolicyConfig, PolicyEngine, ReplayError};
use shellscribe::domain::{EventType, RunId, RunState, TargetProfile, TaskSpec, TaskStatus};
use shellscribe::modules::ScriptedModule;
use shellscribe::storage::{JsonlEventLog, MemoryFindingStore};
use tempfile::TempDir;
use uuid::Uuid;

fn recon(tier: &str) -> TaskSpec {
    TaskSpec::new("recon", "enumerate")
        .with_context("target", "10.0.0.5")
        .with_context("tier", tier)
}

/// Run a small live scenario with one approval and a superseded finding
async fn record_run(log: &Arc<JsonlEventLog>) -> RunId {
    let policy = PolicyEngine::new(PolicyConfig {
        dry_run: false,
        allowlist: vec!["10.0.0.*".to_string()],
        ..Default::default()
    });
    let mut orch = Orchestrator::builder(policy, log.clone(), Arc::new(MemoryFindingStore::new()))
        .module(ScriptedModule::new("recon"))
        .build();

    let run_id = orch
        .start_run(vec![TargetProfile::new("host", "10.0.0.5")])
        .await
        .unwrap();

    orch.submit_task(recon("low").with_param(
        "emit",
        json!([
            {"type": "finding", "id": "F-1", "title": "Telnet open",
             "severity": "medium", "confidence": "low", "targets": ["10.0.0.5"]},
            {"type": "finding", "id": "F-1", "title": "Telnet open with default credentials",
             "severity": "critical", "confidence": "high", "targets": ["10.0.0.5"]}
        ]),
    ))
    .await
    .unwrap();

    let held = orch.submit_task(recon("high")).await.unwrap();
    orch.approve(held).await.unwrap();
    orch.submit_task(recon("low").with_context("target", "172.16.0.1")).await.unwrap();
    orch.finish().await.unwrap();

    run_id
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::new(temp.path()));
    let run_id = record_run(&log).await;

    let first = replay(log.as_ref(), run_id).await.unwrap();
    let second = replay(log.as_ref(), run_id).await.unwrap();
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());

    // A fresh handle on the same directory sees the same history
    let reopened = JsonlEventLog::new(temp.path());
    let third = replay(&reopened, run_id).await.unwrap();
    assert_eq!(first.to_json().unwrap(), third.to_json().unwrap());
}

#[tokio::test]
async fn test_replay_reconstructs_run() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::new(temp.path()));
    let run_id = record_run(&log).await;

    let outcome = replay(log.as_ref(), run_id).await.unwrap();
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.events.last().unwrap().event_type, EventType::RunCompleted);

    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].title, "Telnet open with default credentials");

    assert_eq!(outcome.view.tasks.len(), 3);
    assert_eq!(outcome.view.tasks_with_status(TaskStatus::Executed), 2);
    assert_eq!(outcome.view.tasks_with_status(TaskStatus::Denied), 1);
}

#[tokio::test]
async fn test_replay_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::new(temp.path()));
    let run_id = record_run(&log).await;

    let before = std::fs::read(log.events_path(run_id)).unwrap();
    replay(log.as_ref(), run_id).await.unwrap();
    let after = std::fs::read(log.events_path(run_id)).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_unknown_run() {
    let temp = TempDir::new().unwrap();
    let log = JsonlEventLog::new(temp.path());

    let err = replay(&log, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ReplayError::NotFound(_)));
}

#[tokio::test]
async fn test_execution_without_decision_is_flagged() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::new(temp.path()));
    let run_id = record_run(&log).await;
    let events = replay(log.as_ref(), run_id).await.unwrap().events;

    let tampered: Vec<_> = events
        .iter()
        .filter(|e| e.event_type != EventType::TaskProposed)
        .cloned()
        .collect();
    let err = replay_events(run_id, tampered).unwrap_err();
    assert!(matches!(err, ReplayError::SafetyViolation { .. }));
}

#[tokio::test]
async fn test_execution_without_approval_is_flagged() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::new(temp.path()));
    let run_id = record_run(&log).await;
    let events = replay(log.as_ref(), run_id).await.unwrap().events;

    let tampered: Vec<_> = events
        .iter()
        .filter(|e| e.event_type != EventType::TaskApproved)
        .cloned()
        .collect();
    match replay_events(run_id, tampered).unwrap_err() {
        ReplayError::SafetyViolation { detail, .. } => assert!(detail.contains("approv")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_inconsistent_histories_are_rejected() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::new(temp.path()));
    let run_id = record_run(&log).await;
    let events = replay(log.as_ref(), run_id).await.unwrap().events;

    let mut reordered = events.clone();
    reordered.swap(1, 2);
    assert!(matches!(
        replay_events(run_id, reordered).unwrap_err(),
        ReplayError::OutOfOrder { .. }
    ));

    let mut foreign = events;
    foreign[3].run_id = Uuid::new_v4();
    assert!(matches!(
        replay_events(run_id, foreign).unwrap_err(),
        ReplayError::ForeignEvent { .. }
    ));
}
