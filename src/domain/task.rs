//! Targets, task specifications and policy decisions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed mapping used for params, scopes and contexts.
///
/// A `BTreeMap` keeps serialization order stable, which replay relies on.
pub type Mapping = BTreeMap<String, Value>;

/// An assessment target, fixed for the duration of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    /// Kind of target (host, network, url, ...)
    pub target_type: String,

    /// Scan parameters; identifiers live under `target` and `targets`
    #[serde(default)]
    pub inputs: Mapping,

    /// In/out-of-scope boundaries (`include` / `exclude` glob lists)
    #[serde(default)]
    pub scope: Mapping,

    /// Secret references (never raw secret material)
    #[serde(default)]
    pub credentials: Mapping,
}

impl TargetProfile {
    /// Create a profile for a single target identifier
    pub fn new(target_type: impl Into<String>, target: impl Into<String>) -> Self {
        let mut inputs = Mapping::new();
        inputs.insert("target".to_string(), Value::String(target.into()));
        Self {
            target_type: target_type.into(),
            inputs,
            scope: Mapping::new(),
            credentials: Mapping::new(),
        }
    }

    /// Target identifiers named by this profile
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(Value::String(target)) = self.inputs.get("target") {
            ids.push(target.clone());
        }
        if let Some(Value::Array(targets)) = self.inputs.get("targets") {
            ids.extend(targets.iter().filter_map(|t| t.as_str().map(str::to_string)));
        }
        ids
    }
}

/// A unit of requested work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name of the owning module
    pub module: String,

    /// Human-readable intent
    pub objective: String,

    /// Module-specific arguments
    #[serde(default)]
    pub params: Mapping,

    /// Scope and target references evaluated by the policy engine
    #[serde(default)]
    pub policy_context: Mapping,
}

impl TaskSpec {
    pub fn new(module: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            objective: objective.into(),
            params: Mapping::new(),
            policy_context: Mapping::new(),
        }
    }

    /// Add a module parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add a policy context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.policy_context.insert(key.into(), value.into());
        self
    }

    /// The target named by the policy context, if any
    pub fn target(&self) -> Option<&str> {
        self.policy_context
            .get("target")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
    }
}

/// Outcome of evaluating a task against the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,

    /// Empty when allowed without caveats
    #[serde(default)]
    pub reason: String,

    /// Execution must wait for an approval signal
    #[serde(default)]
    pub requires_approval: bool,

    /// Only simulated execution is permitted
    #[serde(default)]
    pub simulate: bool,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
            requires_approval: false,
            simulate: false,
        }
    }

    pub fn simulated(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_approval: false,
            simulate: true,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_approval: false,
            simulate: false,
        }
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }
}

/// A module's declared risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Low,
    Medium,
    High,
    Critical,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognized target kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Host,
    Network,
    Url,
    Domain,
    Repository,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Network => "network",
            Self::Url => "url",
            Self::Domain => "domain",
            Self::Repository => "repository",
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "network" => Ok(Self::Network),
            "url" => Ok(Self::Url),
            "domain" => Ok(Self::Domain),
            "repository" => Ok(Self::Repository),
            other => Err(format!("unrecognized target type '{}'", other)),
        }
    }
}
