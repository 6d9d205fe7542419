//! Policy evaluation for task execution.
//!
//! Every task passes through [`PolicyEngine::check`] before any module sees
//! it. The engine is a pure function of the task and its configuration:
//! - Dry-run mode allows only simulated execution
//! - Live execution requires the target to match the allowlist
//! - High-risk tiers pause the run for human approval

use std::collections::BTreeMap;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Mapping, PolicyDecision, TargetType, TaskSpec, Tier};
use crate::plugins::PluginManifest;

/// Decision reasons recorded in `TaskProposed` / `TaskDenied` events
pub mod reasons {
    pub const DRY_RUN: &str = "dry_run";
    pub const INVALID_CONTEXT: &str = "invalid_context";
    pub const UNRECOGNIZED_TARGET_TYPE: &str = "unrecognized_target_type";
    pub const MALFORMED_SCOPE: &str = "malformed_scope";
    pub const TARGET_OUT_OF_SCOPE: &str = "target_out_of_scope";
    pub const UNKNOWN_MODULE: &str = "unknown_module";
    pub const MODULE_DISABLED: &str = "module_disabled";
    pub const TARGET_TYPE_NOT_SUPPORTED: &str = "target_type_not_supported";
    pub const UNKNOWN_TIER: &str = "unknown_tier";
    pub const TARGET_NOT_ALLOWLISTED: &str = "target_not_allowlisted";
    pub const APPROVAL_REJECTED: &str = "approval_rejected";
}

/// Policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Simulate everything; nothing runs against a live target (default: true)
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,

    /// Targets permitted for live action (exact strings or glob patterns)
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Tiers whose tasks need human sign-off (default: high, critical)
    #[serde(default = "default_approval_tiers")]
    pub approval_tiers: Vec<Tier>,
}

fn default_dry_run() -> bool {
    true
}

fn default_approval_tiers() -> Vec<Tier> {
    vec![Tier::High, Tier::Critical]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            dry_run: default_dry_run(),
            allowlist: Vec::new(),
            approval_tiers: default_approval_tiers(),
        }
    }
}

impl PolicyConfig {
    /// Check whether a target matches any allowlist entry
    pub fn is_allowlisted(&self, target: &str) -> bool {
        self.allowlist
            .iter()
            .any(|entry| entry == target || glob_matches(entry, target))
    }
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    Pattern::new(pattern)
        .map(|p| p.matches(candidate))
        .unwrap_or(false)
}

/// Pure decision function over tasks
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
    manifests: BTreeMap<String, PluginManifest>,
}

impl PolicyEngine {
    /// Create an engine that knows no plugin manifests
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            manifests: BTreeMap::new(),
        }
    }

    /// Create an engine whose tier and module rules use `manifests`
    pub fn with_manifests(
        config: PolicyConfig,
        manifests: impl IntoIterator<Item = PluginManifest>,
    ) -> Self {
        Self {
            config,
            manifests: manifests
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn manifest(&self, module: &str) -> Option<&PluginManifest> {
        self.manifests.get(module)
    }

    /// Evaluate a task. Never fails: every problem becomes a deny decision.
    pub fn check(&self, task: &TaskSpec) -> PolicyDecision {
        let ctx = &task.policy_context;

        let target = match task.target() {
            Some(target) if !task.module.trim().is_empty() => target,
            _ => return PolicyDecision::deny(reasons::INVALID_CONTEXT),
        };

        let target_type = match ctx.get("target_type") {
            None => None,
            Some(Value::String(s)) => match s.parse::<TargetType>() {
                Ok(t) => Some(t),
                Err(_) => return PolicyDecision::deny(reasons::UNRECOGNIZED_TARGET_TYPE),
            },
            Some(_) => return PolicyDecision::deny(reasons::UNRECOGNIZED_TARGET_TYPE),
        };

        let scope = match ctx.get("scope") {
            None => Scope::default(),
            Some(value) => match Scope::parse(value) {
                Some(scope) => scope,
                None => return PolicyDecision::deny(reasons::MALFORMED_SCOPE),
            },
        };
        if !scope.contains(target) {
            return PolicyDecision::deny(reasons::TARGET_OUT_OF_SCOPE);
        }

        let manifest = self.manifests.get(&task.module);
        if !self.manifests.is_empty() {
            match manifest {
                None => return PolicyDecision::deny(reasons::UNKNOWN_MODULE),
                Some(m) if !m.enabled => return PolicyDecision::deny(reasons::MODULE_DISABLED),
                Some(m) => {
                    if let Some(t) = target_type {
                        if !m.targets.is_empty() && !m.targets.contains(&t) {
                            return PolicyDecision::deny(reasons::TARGET_TYPE_NOT_SUPPORTED);
                        }
                    }
                }
            }
        }

        let tier = match (manifest.map(|m| m.tier), ctx.get("tier")) {
            (Some(tier), _) => Some(tier),
            (None, None) => None,
            (None, Some(Value::String(s))) => match s.parse::<Tier>() {
                Ok(tier) => Some(tier),
                Err(_) => return PolicyDecision::deny(reasons::UNKNOWN_TIER),
            },
            (None, Some(_)) => return PolicyDecision::deny(reasons::UNKNOWN_TIER),
        };

        if self.config.dry_run {
            return PolicyDecision::simulated(reasons::DRY_RUN);
        }

        if !self.config.is_allowlisted(target) {
            return PolicyDecision::deny(reasons::TARGET_NOT_ALLOWLISTED);
        }

        // An undeclared tier is treated as needing sign-off.
        let requires_approval = match tier {
            Some(tier) => self.config.approval_tiers.contains(&tier),
            None => true,
        };

        PolicyDecision::allow().with_approval(requires_approval)
    }
}

/// Include/exclude boundaries from a policy context
#[derive(Debug, Default)]
struct Scope {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Scope {
    /// Parse `{include: [..], exclude: [..]}`; anything else is malformed
    fn parse(value: &Value) -> Option<Self> {
        let map: Mapping = serde_json::from_value(value.clone()).ok()?;
        let mut scope = Self::default();
        for (key, entries) in map {
            let list = string_list(&entries)?;
            match key.as_str() {
                "include" => scope.include = list,
                "exclude" => scope.exclude = list,
                _ => return None,
            }
        }
        Some(scope)
    }

    fn contains(&self, target: &str) -> bool {
        let hit = |p: &String| p == target || glob_matches(p, target);
        if self.exclude.iter().any(hit) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(hit)
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recon_task() -> TaskSpec {
        TaskSpec::new("recon", "enumerate")
            .with_context("target", "10.0.0.5")
            .with_context("tier", "low")
    }

    fn live(allowlist: &[&str]) -> PolicyConfig {
        PolicyConfig {
            dry_run: false,
            allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = PolicyConfig::default();
        assert!(config.dry_run);
        assert!(config.allowlist.is_empty());
        assert_eq!(config.approval_tiers, vec![Tier::High, Tier::Critical]);
    }

    #[test]
    fn test_dry_run_never_requires_approval() {
        let engine = PolicyEngine::new(PolicyConfig::default());
        let task = recon_task().with_context("tier", "critical");

        let decision = engine.check(&task);
        assert!(decision.allowed);
        assert!(decision.simulate);
        assert!(!decision.requires_approval);
        assert_eq!(decision.reason, reasons::DRY_RUN);
    }

    #[test]
    fn test_not_allowlisted() {
        let engine = PolicyEngine::new(live(&[]));
        let decision = engine.check(&recon_task());

        assert!(!decision.allowed);
        assert_eq!(decision.reason, reasons::TARGET_NOT_ALLOWLISTED);
    }

    #[test]
    fn test_allowlist_glob() {
        let config = live(&["10.0.0.*"]);
        assert!(config.is_allowlisted("10.0.0.5"));
        assert!(!config.is_allowlisted("10.0.1.5"));

        let decision = PolicyEngine::new(config).check(&recon_task());
        assert_eq!(decision, PolicyDecision::allow());
    }

    #[test]
    fn test_high_tier_requires_approval() {
        let engine = PolicyEngine::new(live(&["10.0.0.5"]));
        let decision = engine.check(&recon_task().with_context("tier", "high"));

        assert!(decision.allowed);
        assert!(decision.requires_approval);
    }

    #[test]
    fn test_missing_tier_requires_approval() {
        let engine = PolicyEngine::new(live(&["10.0.0.5"]));
        let task = TaskSpec::new("recon", "enumerate").with_context("target", "10.0.0.5");

        assert!(engine.check(&task).requires_approval);
    }

    #[test]
    fn test_invalid_context() {
        let engine = PolicyEngine::new(PolicyConfig::default());

        let no_target = TaskSpec::new("recon", "enumerate");
        assert_eq!(engine.check(&no_target).reason, reasons::INVALID_CONTEXT);

        let no_module = TaskSpec::new("", "enumerate").with_context("target", "10.0.0.5");
        assert_eq!(engine.check(&no_module).reason, reasons::INVALID_CONTEXT);
    }

    #[test]
    fn test_unrecognized_target_type() {
        let engine = PolicyEngine::new(PolicyConfig::default());
        let task = recon_task().with_context("target_type", "satellite");

        let decision = engine.check(&task);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, reasons::UNRECOGNIZED_TARGET_TYPE);
    }

    #[test]
    fn test_malformed_scope() {
        let engine = PolicyEngine::new(PolicyConfig::default());

        let not_a_map = recon_task().with_context("scope", "everything");
        assert_eq!(engine.check(&not_a_map).reason, reasons::MALFORMED_SCOPE);

        let bad_entry = recon_task().with_context("scope", json!({"include": [1, 2]}));
        assert_eq!(engine.check(&bad_entry).reason, reasons::MALFORMED_SCOPE);

        let unknown_key = recon_task().with_context("scope", json!({"maybe": []}));
        assert_eq!(engine.check(&unknown_key).reason, reasons::MALFORMED_SCOPE);
    }

    #[test]
    fn test_scope_exclusion() {
        let engine = PolicyEngine::new(PolicyConfig::default());

        let excluded = recon_task().with_context("scope", json!({"exclude": ["10.0.0.*"]}));
        assert_eq!(engine.check(&excluded).reason, reasons::TARGET_OUT_OF_SCOPE);

        let included = recon_task().with_context("scope", json!({"include": ["10.0.0.0/24", "10.0.0.5"]}));
        assert!(engine.check(&included).allowed);
    }

    #[test]
    fn test_manifest_rules() {
        let manifest = PluginManifest {
            targets: vec![TargetType::Url],
            ..PluginManifest::new("web", "0.1.0", Tier::Critical)
        };
        let engine = PolicyEngine::with_manifests(live(&["10.0.0.5"]), vec![manifest]);

        assert_eq!(engine.check(&recon_task()).reason, reasons::UNKNOWN_MODULE);

        let host_task = TaskSpec::new("web", "crawl")
            .with_context("target", "10.0.0.5")
            .with_context("target_type", "host");
        assert_eq!(engine.check(&host_task).reason, reasons::TARGET_TYPE_NOT_SUPPORTED);

        // Manifest tier wins over the context tier
        let url_task = TaskSpec::new("web", "crawl")
            .with_context("target", "10.0.0.5")
            .with_context("target_type", "url")
            .with_context("tier", "low");
        assert!(engine.check(&url_task).requires_approval);
    }

    #[test]
    fn test_disabled_module() {
        let mut manifest = PluginManifest::new("recon", "0.1.0", Tier::Low);
        manifest.enabled = false;
        let engine = PolicyEngine::with_manifests(PolicyConfig::default(), vec![manifest]);

        assert_eq!(engine.check(&recon_task()).reason, reasons::MODULE_DISABLED);
    }

    #[test]
    fn test_unknown_tier() {
        let engine = PolicyEngine::new(PolicyConfig::default());
        let task = recon_task().with_context("tier", "extreme");
        assert_eq!(engine.check(&task).reason, reasons::UNKNOWN_TIER);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let engine = PolicyEngine::new(live(&["10.0.0.*"]));
        let task = recon_task().with_context("tier", "medium");
        assert_eq!(engine.check(&task), engine.check(&task));
    }
}
