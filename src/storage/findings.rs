//! Finding persistence.
//!
//! SQLite-backed store (`findings.db`) with WAL enabled. A finding is keyed by
//! `(run_id, id)`; recording the same id again supersedes the stored row but
//! keeps its original position in listings.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::core::RetryPolicy;
use crate::domain::{Finding, RunId};

use super::{FindingStore, StorageError};

/// SQL schema for the findings database
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
INSERT OR IGNORE INTO schema_version VALUES (1);

CREATE TABLE IF NOT EXISTS findings (
    run_id TEXT NOT NULL,
    id TEXT NOT NULL,
    title TEXT NOT NULL,
    severity TEXT NOT NULL,                 -- info, low, medium, high, critical
    confidence TEXT NOT NULL,               -- low, medium, high, confirmed
    body_json TEXT NOT NULL,                -- full Finding as JSON
    recorded_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    PRIMARY KEY (run_id, id)
);
CREATE INDEX IF NOT EXISTS idx_findings_severity ON findings(severity);
"#;

/// SQLite-backed finding store
#[derive(Clone)]
pub struct SqliteFindingStore {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for SqliteFindingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFindingStore").finish_non_exhaustive()
    }
}

impl SqliteFindingStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Write(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            StorageError::Write(format!("Failed to open findings db {}: {}", path.display(), e))
        })?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .and_then(|_| conn.pragma_update(None, "synchronous", "NORMAL"))
            .map_err(|e| StorageError::Write(format!("Failed to configure findings db: {}", e)))?;

        Self::with_connection(conn)
    }

    /// In-memory database (lost on drop)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Write(format!("Failed to open findings db: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StorageError::Write(format!("Failed to initialize schema: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn insert(conn: &Mutex<Connection>, run_id: RunId, finding: &Finding) -> Result<(), StorageError> {
        let body = serde_json::to_string(finding)
            .map_err(|e| StorageError::Write(format!("Failed to serialize finding: {}", e)))?;
        let conn = conn
            .lock()
            .map_err(|_| StorageError::Write("findings db lock poisoned".to_string()))?;

        conn.execute(
            r#"
            INSERT INTO findings (run_id, id, title, severity, confidence, body_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(run_id, id) DO UPDATE SET
                title = excluded.title,
                severity = excluded.severity,
                confidence = excluded.confidence,
                body_json = excluded.body_json
            "#,
            params![
                run_id.to_string(),
                finding.id,
                finding.title,
                finding.severity.as_str(),
                finding.confidence.as_str(),
                body,
            ],
        )
        .map_err(|e| StorageError::Write(format!("Failed to record finding {}: {}", finding.id, e)))?;

        Ok(())
    }

    fn query(conn: &Mutex<Connection>, run_id: Option<RunId>) -> Result<Vec<Finding>, StorageError> {
        let conn = conn
            .lock()
            .map_err(|_| StorageError::Read("findings db lock poisoned".to_string()))?;
        let read_err = |e: rusqlite::Error| StorageError::Read(format!("Failed to list findings: {}", e));

        let mut stmt = conn
            .prepare(
                r#"
                SELECT body_json FROM findings
                WHERE ?1 IS NULL OR run_id = ?1
                ORDER BY rowid
                "#,
            )
            .map_err(read_err)?;

        let bodies = stmt
            .query_map(params![run_id.map(|id| id.to_string())], |row| {
                row.get::<_, String>(0)
            })
            .map_err(read_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err)?;

        bodies
            .iter()
            .map(|body| {
                serde_json::from_str(body)
                    .map_err(|e| StorageError::Corrupt(format!("Failed to parse finding: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl FindingStore for SqliteFindingStore {
    async fn add_finding(&self, run_id: RunId, finding: &Finding) -> Result<(), StorageError> {
        self.retry
            .run("findings.add", || {
                let conn = self.conn.clone();
                let finding = finding.clone();
                async move {
                    tokio::task::spawn_blocking(move || Self::insert(&conn, run_id, &finding))
                        .await
                        .map_err(|e| StorageError::Write(format!("Insert task failed: {}", e)))?
                }
            })
            .await?;

        debug!(%run_id, finding = %finding.id, "Finding recorded");
        Ok(())
    }

    async fn list_findings(&self, run_id: Option<RunId>) -> Result<Vec<Finding>, StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::query(&conn, run_id))
            .await
            .map_err(|e| StorageError::Read(format!("Query task failed: {}", e)))?
    }
}

/// In-memory finding store
#[derive(Debug, Default)]
pub struct MemoryFindingStore {
    findings: Mutex<Vec<(RunId, Finding)>>,
}

impl MemoryFindingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FindingStore for MemoryFindingStore {
    async fn add_finding(&self, run_id: RunId, finding: &Finding) -> Result<(), StorageError> {
        let mut findings = self
            .findings
            .lock()
            .map_err(|_| StorageError::Write("finding store lock poisoned".to_string()))?;

        match findings
            .iter_mut()
            .find(|(run, f)| *run == run_id && f.id == finding.id)
        {
            Some((_, existing)) => *existing = finding.clone(),
            None => findings.push((run_id, finding.clone())),
        }
        Ok(())
    }

    async fn list_findings(&self, run_id: Option<RunId>) -> Result<Vec<Finding>, StorageError> {
        let findings = self
            .findings
            .lock()
            .map_err(|_| StorageError::Read("finding store lock poisoned".to_string()))?;

        Ok(findings
            .iter()
            .filter(|(run, _)| run_id.map_or(true, |id| id == *run))
            .map(|(_, f)| f.clone())
            .collect())
    }
}
