//! Policy Engine Integration Tests
//!
//! Tests for task gating: dry-run simulation, allowlists, approval tiers,
//! scopes and plugin manifests, and the order the checks run in.

use serde_json::json;
use shellscribe::core::{reasons, PolicyConfig, PolicyEngine};
use shellscribe::domain::{TargetType, TaskSpec, Tier};
use shellscribe::plugins::PluginManifest;

fn task(target: &str, tier: &str) -> TaskSpec {
    TaskSpec::new("recon", "enumerate")
        .with_context("target", target)
        .with_context("tier", tier)
}

fn live(allowlist: &[&str]) -> PolicyConfig {
    PolicyConfig {
        dry_run: false,
        allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[test]
fn test_dry_run_allows_without_approval() {
    let engine = PolicyEngine::new(PolicyConfig::default());

    for tier in ["low", "medium", "high", "critical"] {
        let decision = engine.check(&task("10.0.0.5", tier));
        assert!(decision.allowed, "tier {}", tier);
        assert!(decision.simulate);
        assert!(!decision.requires_approval, "tier {}", tier);
        assert_eq!(decision.reason, reasons::DRY_RUN);
    }
}

#[test]
fn test_dry_run_does_not_bypass_context_checks() {
    let engine = PolicyEngine::new(PolicyConfig::default());

    let missing_target = TaskSpec::new("recon", "enumerate").with_context("tier", "low");
    assert_eq!(engine.check(&missing_target).reason, reasons::INVALID_CONTEXT);

    let bad_tier = task("10.0.0.5", "extreme");
    assert_eq!(engine.check(&bad_tier).reason, reasons::UNKNOWN_TIER);
}

#[test]
fn test_target_not_allowlisted() {
    let engine = PolicyEngine::new(live(&[]));

    let decision = engine.check(&task("10.0.0.5", "low"));
    assert!(!decision.allowed);
    assert_eq!(decision.reason, reasons::TARGET_NOT_ALLOWLISTED);
}

#[test]
fn test_allowlist_globs() {
    let engine = PolicyEngine::new(live(&["10.0.0.*", "*.corp.example"]));

    assert!(engine.check(&task("10.0.0.17", "low")).allowed);
    assert!(engine.check(&task("web.corp.example", "low")).allowed);
    assert!(!engine.check(&task("10.0.1.17", "low")).allowed);
    assert!(!engine.check(&task("corp.example.org", "low")).allowed);
}

#[test]
fn test_approval_tiers() {
    let engine = PolicyEngine::new(live(&["10.0.0.5"]));

    let expectations = [("low", false), ("medium", false), ("high", true), ("critical", true)];
    for (tier, needs_approval) in expectations {
        let decision = engine.check(&task("10.0.0.5", tier));
        assert!(decision.allowed);
        assert!(!decision.simulate);
        assert_eq!(decision.requires_approval, needs_approval, "tier {}", tier);
    }

    let custom = PolicyEngine::new(PolicyConfig {
        approval_tiers: vec![Tier::Medium],
        ..live(&["10.0.0.5"])
    });
    assert!(custom.check(&task("10.0.0.5", "medium")).requires_approval);
    assert!(!custom.check(&task("10.0.0.5", "critical")).requires_approval);
}

#[test]
fn test_missing_tier_requires_approval_when_live() {
    let engine = PolicyEngine::new(live(&["10.0.0.5"]));
    let untiered = TaskSpec::new("recon", "enumerate").with_context("target", "10.0.0.5");

    let decision = engine.check(&untiered);
    assert!(decision.allowed);
    assert!(decision.requires_approval);
}

#[test]
fn test_scope_exclusions_win() {
    let engine = PolicyEngine::new(live(&["10.0.0.*"]));
    let scoped = |target: &str| {
        task(target, "low").with_context(
            "scope",
            json!({"include": ["10.0.0.*"], "exclude": ["10.0.0.1"]}),
        )
    };

    assert!(engine.check(&scoped("10.0.0.5")).allowed);
    assert_eq!(engine.check(&scoped("10.0.0.1")).reason, reasons::TARGET_OUT_OF_SCOPE);

    let malformed = task("10.0.0.5", "low").with_context("scope", json!("everything"));
    assert_eq!(engine.check(&malformed).reason, reasons::MALFORMED_SCOPE);
}

#[test]
fn test_manifests_gate_modules() {
    let mut scanner = PluginManifest::new("recon", "1.0.0", Tier::Low);
    scanner.targets = vec![TargetType::Host];
    let mut disabled = PluginManifest::new("exploit", "0.1.0", Tier::Critical);
    disabled.enabled = false;

    let engine = PolicyEngine::with_manifests(live(&["10.0.0.5"]), vec![scanner, disabled]);

    // Manifest tier overrides the task's own claim
    let decision = engine.check(&task("10.0.0.5", "critical"));
    assert!(decision.allowed);
    assert!(!decision.requires_approval);

    let url_task = task("10.0.0.5", "low").with_context("target_type", "url");
    assert_eq!(engine.check(&url_task).reason, reasons::TARGET_TYPE_NOT_SUPPORTED);

    let unknown = TaskSpec::new("fuzzer", "fuzz").with_context("target", "10.0.0.5");
    assert_eq!(engine.check(&unknown).reason, reasons::UNKNOWN_MODULE);

    let off = TaskSpec::new("exploit", "pop").with_context("target", "10.0.0.5");
    assert_eq!(engine.check(&off).reason, reasons::MODULE_DISABLED);
}

#[test]
fn test_evaluation_order() {
    // Structural problems are reported before the dry-run shortcut and the allowlist
    let dry = PolicyEngine::new(PolicyConfig::default());
    let bad_type = task("10.0.0.5", "low").with_context("target_type", "satellite");
    assert_eq!(dry.check(&bad_type).reason, reasons::UNRECOGNIZED_TARGET_TYPE);

    // Out-of-scope wins over not-allowlisted
    let live_engine = PolicyEngine::new(live(&[]));
    let out_of_scope = task("10.0.0.5", "low").with_context("scope", json!({"exclude": ["10.0.0.5"]}));
    assert_eq!(live_engine.check(&out_of_scope).reason, reasons::TARGET_OUT_OF_SCOPE);

    // Unknown tier wins over not-allowlisted
    assert_eq!(live_engine.check(&task("10.0.0.5", "extreme")).reason, reasons::UNKNOWN_TIER);
}

#[test]
fn test_decisions_are_deterministic() {
    let engine = PolicyEngine::new(live(&["10.0.0.*"]));
    let spec = task("10.0.0.9", "high");

    let first = engine.check(&spec);
    for _ in 0..10 {
        assert_eq!(engine.check(&spec), first);
    }
}
