//! Command-line interface for shellscribe.
//!
//! Provides commands for initializing a project, editing configuration and
//! policy, running scenarios, replaying and reporting on past runs, and
//! managing plugins.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::{replay, Orchestrator, PolicyEngine, RunEvents, Scenario};
use crate::domain::{Event, RunId, RunState, RunView, TaskStatus};
use crate::inference;
use crate::modules::{ModuleRegistry, ScriptedModule};
use crate::plugins::PluginRegistry;
use crate::storage::{EventLog, FindingStore, FsArtifactStore, JsonlEventLog, SqliteFindingStore};

pub mod plugins;
pub mod settings;

/// shellscribe - policy-gated orchestrator for security assessment tasks
#[derive(Parser, Debug)]
#[command(name = "shellscribe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the project state directory
    Project {
        #[command(subcommand)]
        command: settings::ProjectCommands,
    },

    /// Read or edit configuration
    Config {
        #[command(subcommand)]
        command: settings::ConfigCommands,
    },

    /// Manage policy settings
    Policy {
        #[command(subcommand)]
        command: settings::PolicyCommands,
    },

    /// Run a scenario
    Run {
        /// Scenario file (or name, looked up as scenarios/<name>.yaml)
        scenario: String,

        /// Approve every task that needs approval without prompting
        #[arg(long)]
        auto_approve: bool,
    },

    /// Replay a run from its event log (read-only)
    Replay {
        /// Run ID (UUID)
        run_id: String,

        /// Print the replay outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the findings of a run
    Report {
        /// Run ID (UUID)
        run_id: String,

        /// Print findings as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        command: plugins::PluginCommands,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Project { command } => settings::execute_project(command),
            Commands::Config { command } => settings::execute_config(command),
            Commands::Policy { command } => settings::execute_policy(command),
            Commands::Run {
                scenario,
                auto_approve,
            } => run_scenario(&scenario, auto_approve).await,
            Commands::Replay { run_id, json } => replay_run(&run_id, json).await,
            Commands::Report { run_id, json } => report(&run_id, json).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Plugins { command } => plugins::execute(command),
        }
    }
}

fn parse_run_id(run_id: &str) -> Result<RunId> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Load a scenario by path or name
fn load_scenario(name: &str) -> Result<Scenario> {
    let direct = PathBuf::from(name);
    let by_name = PathBuf::from("scenarios").join(format!("{}.yaml", name));

    let path = if direct.is_file() {
        direct
    } else if by_name.is_file() {
        by_name
    } else {
        anyhow::bail!(
            "Scenario '{}' not found. Looked for:\n  - {}\n  - {}",
            name,
            direct.display(),
            by_name.display()
        );
    };

    let scenario = Scenario::from_file(&path)?;
    scenario.validate()?;
    Ok(scenario)
}

/// Build an orchestrator from configuration. Every module the scenario
/// addresses is served by a scripted module. A runtime that cannot be
/// constructed leaves modules without inference instead of failing the run.
fn build_orchestrator(resolved: &ResolvedConfig, scenario: &Scenario) -> Result<Orchestrator> {
    let cfg = &resolved.config;
    let plugins = PluginRegistry::load(&resolved.plugins_path())?;
    let policy = PolicyEngine::with_manifests(cfg.policy_config(), plugins.list().iter().cloned());

    let event_log = Arc::new(JsonlEventLog::new(resolved.runs_dir()));
    let findings = Arc::new(SqliteFindingStore::open(&resolved.findings_db())?);
    let artifacts = Arc::new(FsArtifactStore::new(resolved.artifacts_dir()));

    let mut modules = ModuleRegistry::new();
    for name in scenario.modules() {
        modules.register(ScriptedModule::new(name));
    }

    let mut builder = Orchestrator::builder(policy, event_log, findings)
        .modules(modules)
        .plugins(plugins)
        .artifacts(artifacts)
        .workers(cfg.workers)
        .offline(cfg.offline);

    match inference::backend_for(&cfg.llm_runtime, &cfg.inference, cfg.offline) {
        Ok(backend) => builder = builder.inference(backend),
        Err(e) => warn!(runtime = %cfg.llm_runtime, error = %format!("{:#}", e), "Inference backend unavailable"),
    }

    Ok(builder.build())
}

/// Run a scenario, prompting for approvals unless `auto_approve`
async fn run_scenario(name: &str, auto_approve: bool) -> Result<()> {
    let scenario = load_scenario(name)?;
    let resolved = config::load()?;
    let mut orchestrator = build_orchestrator(&resolved, &scenario)?;
    let mut events = orchestrator.events()?;

    if resolved.config.dry_run {
        eprintln!("[dry run: tasks are simulated]");
    }

    let run_id = orchestrator.start_run(scenario.targets.clone()).await?;
    eprintln!("[Run {} started: {}]", run_id, scenario.name);

    for task in scenario.tasks {
        orchestrator.submit_task(task).await?;
        print_available(&mut events);

        while let RunState::Paused { task_id } = orchestrator.state().clone() {
            if auto_approve || confirm(&format!("Approve task {}?", task_id))? {
                orchestrator.approve(task_id).await?;
            } else {
                orchestrator.reject(task_id, None).await?;
            }
            print_available(&mut events);
        }
    }

    let state = orchestrator.finish().await?;
    for event in events.collect().await {
        print_event(&event);
    }

    eprintln!("\n[Run {} {}]", run_id, state.name());
    Ok(())
}

fn print_available(events: &mut RunEvents) {
    while let Some(event) = events.try_next() {
        print_event(&event);
    }
}

fn print_event(event: &Event) {
    let task = event
        .task_id
        .map(|id| id.to_string()[..8].to_string())
        .unwrap_or_else(|| "-".to_string());
    let detail = event
        .error
        .clone()
        .or_else(|| event.payload_field::<String>("reason"))
        .or_else(|| event.payload_field::<String>("kind"))
        .unwrap_or_default();
    println!("{:>4}  {:<24} {:<8}  {}", event.seq, event.event_type, task, detail);
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{} [y/N] ", prompt);
    io::stderr().flush().ok();

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read approval")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Replay a run read-only and summarize it
async fn replay_run(run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let resolved = config::load()?;
    let log = JsonlEventLog::new(resolved.runs_dir());

    let outcome = replay(&log, run_id).await?;

    if json {
        println!("{}", outcome.to_json()?);
        return Ok(());
    }

    for event in &outcome.events {
        print_event(event);
    }
    let view = &outcome.view;
    println!("\nRun ID: {}", outcome.run_id);
    println!("State: {}", outcome.state.name());
    if let RunState::Aborted { reason } = &outcome.state {
        println!("Reason: {}", reason);
    }
    println!(
        "Tasks: {} executed, {} denied, {} skipped, {} failed",
        view.tasks_with_status(TaskStatus::Executed),
        view.tasks_with_status(TaskStatus::Denied),
        view.tasks_with_status(TaskStatus::Skipped),
        view.tasks_with_status(TaskStatus::Failed),
    );
    println!("Findings: {}", outcome.findings.len());
    println!("Faults: {}", view.faults);
    Ok(())
}

/// Print the findings of a run
async fn report(run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let resolved = config::load()?;
    let store = SqliteFindingStore::open(&resolved.findings_db())?;
    let findings = store.list_findings(Some(run_id)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&findings)?);
        return Ok(());
    }

    if findings.is_empty() {
        println!("No findings for run {}", run_id);
        return Ok(());
    }

    println!("{:<12} {:<10} {:<10} {:<30} {}", "ID", "SEVERITY", "CONFIDENCE", "TARGETS", "TITLE");
    println!("{}", "-".repeat(90));
    for finding in findings {
        let targets: Vec<&str> = finding.targets.iter().map(String::as_str).collect();
        println!(
            "{:<12} {:<10} {:<10} {:<30} {}",
            finding.id,
            finding.severity,
            finding.confidence,
            targets.join(","),
            finding.title
        );
    }
    Ok(())
}

/// List recorded runs, most recent first
async fn list_runs(limit: usize) -> Result<()> {
    let resolved = config::load()?;
    let log = JsonlEventLog::new(resolved.runs_dir());

    let mut runs: Vec<RunView> = Vec::new();
    for run_id in log.list_runs().await? {
        let events = log.read_all(run_id).await?;
        if let Some(view) = RunView::from_events(&events) {
            runs.push(view);
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<22} {:>5} {:>8}", "RUN ID", "STATE", "STARTED", "TASKS", "FINDINGS");
    println!("{}", "-".repeat(87));
    for run in runs.into_iter().take(limit) {
        println!(
            "{:<38} {:<10} {:<22} {:>5} {:>8}",
            run.id,
            run.state.name(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.tasks.len(),
            run.current_findings().len()
        );
    }
    Ok(())
}
