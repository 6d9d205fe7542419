//! Findings: security-relevant facts discovered by modules.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::task::Mapping;

/// A discovered security-relevant fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Unique within a run; a newer finding with the same id supersedes the old one
    pub id: String,

    pub title: String,

    pub severity: Severity,

    pub confidence: Confidence,

    /// Target identifiers this finding is about
    #[serde(default)]
    pub targets: BTreeSet<String>,

    /// Ordered artifact paths or event ids backing the finding
    #[serde(default)]
    pub evidence: Vec<String>,

    #[serde(default)]
    pub provenance: Mapping,

    #[serde(default)]
    pub timestamps: Mapping,

    #[serde(default)]
    pub metadata: Mapping,
}

impl Finding {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
        confidence: Confidence,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            severity,
            confidence,
            targets: BTreeSet::new(),
            evidence: Vec::new(),
            provenance: Mapping::new(),
            timestamps: Mapping::new(),
            metadata: Mapping::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.insert(target.into());
        self
    }

    pub fn with_evidence(mut self, reference: impl Into<String>) -> Self {
        self.evidence.push(reference.into());
        self
    }

    /// Whether at least one of the finding's targets is among `known`
    pub fn references_any<'a>(&self, known: impl IntoIterator<Item = &'a str>) -> bool {
        known.into_iter().any(|t| self.targets.contains(t))
    }
}

/// Impact rating of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certainty rating of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Confirmed,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Confirmed => "confirmed",
        }
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "confirmed" => Ok(Self::Confirmed),
            other => Err(format!("unknown confidence '{}'", other)),
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_any() {
        let finding = Finding::new("F-1", "Open SSH", Severity::Low, Confidence::High)
            .with_target("10.0.0.5");

        assert!(finding.references_any(["10.0.0.4", "10.0.0.5"]));
        assert!(!finding.references_any(["10.0.0.4"]));
        assert!(!finding.references_any(Vec::<&str>::new()));
    }

    #[test]
    fn test_vocabulary_is_closed() {
        let err = serde_json::from_str::<Severity>("\"severe\"");
        assert!(err.is_err());
        assert_eq!("confirmed".parse::<Confidence>(), Ok(Confidence::Confirmed));
    }
}
