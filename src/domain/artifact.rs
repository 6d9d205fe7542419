//! Artifacts: stored byproducts (captures, logs, files) referenced by findings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::task::Mapping;

/// A stored byproduct of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Store-relative path
    pub path: String,

    /// Content hash, format "sha256:<hex>"
    pub checksum: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,

    /// Module or tool that produced the artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Mapping,
}

impl Artifact {
    /// Describe `content` stored at `path`
    pub fn from_bytes(path: impl Into<String>, content: &[u8]) -> Self {
        Self {
            path: path.into(),
            checksum: compute_checksum(content),
            mime: None,
            source: None,
            created_at: Utc::now(),
            metadata: Mapping::new(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Check `content` against the recorded checksum
    pub fn verify(&self, content: &[u8]) -> bool {
        self.checksum == compute_checksum(content)
    }
}

/// SHA256 of `bytes` as "sha256:<hex>"
pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_checksum() {
        let artifact = Artifact::from_bytes("captures/nmap.xml", b"<nmaprun/>")
            .with_mime("application/xml")
            .with_source("recon");

        assert!(artifact.checksum.starts_with("sha256:"));
        assert_eq!(artifact.checksum.len(), "sha256:".len() + 64);
        assert!(artifact.verify(b"<nmaprun/>"));
        assert!(!artifact.verify(b"<nmaprun>tampered</nmaprun>"));
    }

    #[test]
    fn test_checksum_consistency() {
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_ne!(compute_checksum(b"abc"), compute_checksum(b"abd"));
    }
}
