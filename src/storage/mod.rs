//! Persistence collaborators used by the orchestrator.
//!
//! The orchestrator only depends on the traits here:
//! - EventLog: append-only, per-run event history (JSONL on disk)
//! - FindingStore: findings queryable by run (SQLite)
//! - ArtifactStore: checksum-verified byproducts (files + metadata sidecars)

pub mod artifacts;
pub mod event_log;
pub mod findings;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Artifact, Event, Finding, RunId};

pub use artifacts::FsArtifactStore;
pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use findings::{MemoryFindingStore, SqliteFindingStore};

/// Storage failures
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Write failed: {0}")]
    Write(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Artifact path that is empty or escapes the store root
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Append-only event history
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist one event at the end of its run's history
    async fn append(&self, event: &Event) -> Result<(), StorageError>;

    /// Every event of a run, in append order
    async fn read_all(&self, run_id: RunId) -> Result<Vec<Event>, StorageError>;

    /// Runs with at least one persisted event
    async fn list_runs(&self) -> Result<Vec<RunId>, StorageError>;
}

/// Finding persistence
#[async_trait]
pub trait FindingStore: Send + Sync {
    /// Record a finding; a finding with the same id in the same run is replaced
    async fn add_finding(&self, run_id: RunId, finding: &Finding) -> Result<(), StorageError>;

    /// Findings of one run, or of all runs, in first-recorded order
    async fn list_findings(&self, run_id: Option<RunId>) -> Result<Vec<Finding>, StorageError>;
}

/// Artifact persistence with integrity checks on read
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn add(&self, artifact: &Artifact, content: &[u8]) -> Result<(), StorageError>;

    /// Artifact metadata, after verifying the stored content's checksum
    async fn get(&self, path: &str) -> Result<Option<Artifact>, StorageError>;
}
