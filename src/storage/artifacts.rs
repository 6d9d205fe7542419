//! Filesystem artifact store.
//!
//! Content lives at `<root>/<path>` with its metadata in a
//! `<root>/<path>.meta.json` sidecar. Reads re-hash the content and refuse
//! artifacts whose checksum no longer matches.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::domain::{compute_checksum, Artifact};

use super::{ArtifactStore, StorageError};

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a store-relative path, rejecting anything that escapes the root
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        safe.then(|| self.root.join(relative))
    }

    fn sidecar(content_path: &Path) -> PathBuf {
        let mut name = content_path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    /// Stored content after checksum verification
    pub async fn read(&self, path: &str) -> Result<Option<(Artifact, Vec<u8>)>, StorageError> {
        let Some(content_path) = self.resolve(path) else {
            return Ok(None);
        };
        let meta_path = Self::sidecar(&content_path);
        if !meta_path.exists() {
            return Ok(None);
        }

        let meta = fs::read_to_string(&meta_path)
            .await
            .map_err(|e| StorageError::Read(format!("Failed to read {}: {}", meta_path.display(), e)))?;
        let artifact: Artifact = serde_json::from_str(&meta)
            .map_err(|e| StorageError::Corrupt(format!("Failed to parse artifact metadata: {}", e)))?;

        let content = fs::read(&content_path).await.map_err(|e| {
            StorageError::Read(format!("Failed to read {}: {}", content_path.display(), e))
        })?;

        let actual = compute_checksum(&content);
        if actual != artifact.checksum {
            return Err(StorageError::ChecksumMismatch {
                path: path.to_string(),
                expected: artifact.checksum,
                actual,
            });
        }

        Ok(Some((artifact, content)))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn add(&self, artifact: &Artifact, content: &[u8]) -> Result<(), StorageError> {
        let content_path = self
            .resolve(&artifact.path)
            .ok_or_else(|| StorageError::InvalidPath(artifact.path.clone()))?;

        if !artifact.verify(content) {
            return Err(StorageError::ChecksumMismatch {
                path: artifact.path.clone(),
                expected: artifact.checksum.clone(),
                actual: compute_checksum(content),
            });
        }

        if let Some(parent) = content_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Write(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let meta = serde_json::to_string_pretty(artifact)
            .map_err(|e| StorageError::Write(format!("Failed to serialize artifact: {}", e)))?;

        fs::write(&content_path, content).await.map_err(|e| {
            StorageError::Write(format!("Failed to write {}: {}", content_path.display(), e))
        })?;
        let meta_path = Self::sidecar(&content_path);
        fs::write(&meta_path, meta).await.map_err(|e| {
            StorageError::Write(format!("Failed to write {}: {}", meta_path.display(), e))
        })?;

        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Artifact>, StorageError> {
        Ok(self.read(path).await?.map(|(artifact, _)| artifact))
    }
}
