//! Append-only event log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL), one file per run at
//! `<runs_dir>/<run_id>/events.jsonl`, for easy inspection and replay.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use uuid::Uuid;

use crate::core::RetryPolicy;
use crate::domain::{Event, RunId};

use super::{EventLog, StorageError};

/// File-based event log using JSONL format
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    /// Directory containing one subdirectory per run
    base_dir: PathBuf,

    retry: RetryPolicy,
}

impl JsonlEventLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding a run's files
    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.base_dir.join(run_id.to_string())
    }

    /// Path to a run's events file
    pub fn events_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }
}

/// Append one line under an exclusive lock
fn append_line(path: &Path, line: &str) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::Write(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::Write(format!("Failed to open {}: {}", path.display(), e)))?;

    file.lock_exclusive()
        .map_err(|e| StorageError::Write(format!("Failed to lock {}: {}", path.display(), e)))?;

    let result = writeln!(file, "{}", line)
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_data())
        .map_err(|e| StorageError::Write(format!("Failed to write {}: {}", path.display(), e)));

    // Unlock errors are irrelevant once the line is written; drop releases it anyway.
    let _ = file.unlock();
    result
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: &Event) -> Result<(), StorageError> {
        let line = serde_json::to_string(event)
            .map_err(|e| StorageError::Write(format!("Failed to serialize event: {}", e)))?;
        let path = self.events_path(event.run_id);

        self.retry
            .run("event_log.append", || {
                let path = path.clone();
                let line = line.clone();
                async move {
                    tokio::task::spawn_blocking(move || append_line(&path, &line))
                        .await
                        .map_err(|e| StorageError::Write(format!("Append task failed: {}", e)))?
                }
            })
            .await?;

        debug!(run_id = %event.run_id, seq = event.seq, event_type = %event.event_type, "Event appended");
        Ok(())
    }

    async fn read_all(&self, run_id: RunId) -> Result<Vec<Event>, StorageError> {
        let path = self.events_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .map_err(|e| StorageError::Read(format!("Failed to open {}: {}", path.display(), e)))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| StorageError::Read(format!("Failed to read {}: {}", path.display(), e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .map_err(|e| StorageError::Corrupt(format!("Failed to parse event: {}: {}", e, line)))?;
            events.push(event);
        }

        Ok(events)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StorageError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let read_err = |e: std::io::Error| {
            StorageError::Read(format!("Failed to list {}: {}", self.base_dir.display(), e))
        };

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await.map_err(read_err)?;

        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            if !entry.file_type().await.map_err(read_err)?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(run_id) = Uuid::parse_str(name) {
                    if entry.path().join("events.jsonl").exists() {
                        runs.push(run_id);
                    }
                }
            }
        }

        runs.sort();
        Ok(runs)
    }
}

/// In-memory event log, for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far, across runs
    pub fn snapshot(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &Event) -> Result<(), StorageError> {
        self.events
            .lock()
            .map_err(|_| StorageError::Write("event log lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }

    async fn read_all(&self, run_id: RunId) -> Result<Vec<Event>, StorageError> {
        let events = self
            .events
            .lock()
            .map_err(|_| StorageError::Read("event log lock poisoned".to_string()))?;
        Ok(events.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StorageError> {
        let events = self
            .events
            .lock()
            .map_err(|_| StorageError::Read("event log lock poisoned".to_string()))?;
        let mut runs: Vec<RunId> = events.iter().map(|e| e.run_id).collect();
        runs.sort();
        runs.dedup();
        Ok(runs)
    }
}
