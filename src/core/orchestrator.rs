//! Run orchestrator.
//!
//! Owns the run lifecycle: every task goes through the policy engine before a
//! module sees it, every state transition is published as an event, persisted
//! to the event log and fanned out on the bus. Module execution runs on a
//! bounded worker pool; completions come back over a channel and are
//! published here, so a run's events are totally ordered by `seq`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Event, EventType, PolicyDecision, Provenance, RunId, RunState, TargetProfile, TaskId, TaskSpec,
};
use crate::inference::InferenceBackend;
use crate::modules::{Emission, Module, ModuleContext, ModuleInitError, ModuleRegistry, TaskContext};
use crate::plugins::PluginRegistry;
use crate::storage::{ArtifactStore, EventLog, FindingStore, StorageError};

use super::event_bus::{EventBus, EventBusBuilder, EventHandler, HandlerFailure};
use super::policy::{reasons, PolicyEngine};

/// Default size of the module worker pool
pub const DEFAULT_WORKERS: usize = 4;

/// Bus subscriptions made on behalf of modules are named with this prefix
const MODULE_HANDLER_PREFIX: &str = "module:";

/// Reason recorded on `TaskSkipped` for a module excluded after a fault
pub const MODULE_EXCLUDED: &str = "module_excluded";

/// Reason recorded on `TaskSkipped` for a module nobody registered
pub const MODULE_NOT_REGISTERED: &str = "module_not_registered";

/// Errors surfaced to the driver of a run
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cannot {operation} while the run is {state}")]
    InvalidRunState {
        operation: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    ModuleInit(#[from] ModuleInitError),

    #[error("Persistence failed, run aborted: {0}")]
    Write(#[from] StorageError),

    #[error("Task {0} is not awaiting approval")]
    UnknownTask(TaskId),
}

type Result<T> = std::result::Result<T, OrchestratorError>;

/// A module's answer for one dispatched task
struct Completion {
    task_id: TaskId,
    module: String,
    outcome: Outcome,
}

enum Outcome {
    Finished(anyhow::Result<Vec<Emission>>),

    /// The run was aborted before the worker got a permit
    NotStarted,
}

/// The run's events, in publication order.
///
/// Ends once the run reaches Completed or Aborted.
#[derive(Debug)]
pub struct RunEvents {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl RunEvents {
    /// Next event, waiting for it to be published
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one has already been published
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drain the stream to the end of the run
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Wires collaborators, modules and bus subscriptions into an [`Orchestrator`]
pub struct OrchestratorBuilder {
    policy: PolicyEngine,
    event_log: Arc<dyn EventLog>,
    findings: Arc<dyn FindingStore>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    inference: Option<Arc<dyn InferenceBackend>>,
    modules: ModuleRegistry,
    plugins: Option<PluginRegistry>,
    bus: EventBusBuilder,
    workers: usize,
    offline: bool,
}

impl OrchestratorBuilder {
    pub fn module(mut self, module: impl Module + 'static) -> Self {
        self.modules.register(module);
        self
    }

    pub fn modules(mut self, modules: ModuleRegistry) -> Self {
        self.modules = modules;
        self
    }

    /// Only modules with an enabled manifest in `plugins` will run
    pub fn plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn inference(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.inference = Some(backend);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn subscribe(
        mut self,
        event_type: EventType,
        name: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Self {
        self.bus.subscribe(event_type, name, handler);
        self
    }

    pub fn subscribe_all(mut self, name: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.bus.subscribe_all(name, handler);
        self
    }

    /// Resolve modules, register their subscriptions and freeze the bus
    pub fn build(self) -> Orchestrator {
        let modules = match &self.plugins {
            Some(plugins) => self.modules.resolve(plugins),
            None => self.modules,
        };

        let excluded: Arc<Mutex<BTreeSet<String>>> = Arc::default();
        let mut bus = self.bus;
        for (name, module) in modules.iter() {
            for event_type in module.subscriptions() {
                bus.subscribe(
                    event_type,
                    format!("{}{}", MODULE_HANDLER_PREFIX, name),
                    module_handler(name.clone(), module.clone(), excluded.clone()),
                );
            }
        }

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();

        Orchestrator {
            policy: self.policy,
            event_log: self.event_log,
            findings: self.findings,
            artifacts: self.artifacts,
            inference: self.inference,
            modules,
            bus: bus.freeze(),
            offline: self.offline,
            workers: Arc::new(Semaphore::new(self.workers)),
            excluded,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: RunState::Idle,
            run_id: None,
            target_ids: BTreeSet::new(),
            seq: 0,
            last_timestamp: None,
            held: None,
            queue: VecDeque::new(),
            in_flight: 0,
            completions_tx,
            completions_rx,
            stream_tx: Some(stream_tx),
            stream_rx: Some(stream_rx),
        }
    }
}

/// Bus handler forwarding events to a module's `on_event`
fn module_handler(
    name: String,
    module: Arc<dyn Module>,
    excluded: Arc<Mutex<BTreeSet<String>>>,
) -> impl EventHandler {
    move |event: &Event| -> anyhow::Result<()> {
        if event.provenance.module.as_deref() == Some(name.as_str()) {
            return Ok(());
        }
        let is_excluded = excluded.lock().map(|set| set.contains(&name)).unwrap_or(true);
        if is_excluded {
            return Ok(());
        }
        module.on_event(event)
    }
}

/// Drives a single run
pub struct Orchestrator {
    policy: PolicyEngine,
    event_log: Arc<dyn EventLog>,
    findings: Arc<dyn FindingStore>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    inference: Option<Arc<dyn InferenceBackend>>,
    modules: ModuleRegistry,
    bus: EventBus,
    offline: bool,

    workers: Arc<Semaphore>,
    excluded: Arc<Mutex<BTreeSet<String>>>,
    cancelled: Arc<AtomicBool>,

    state: RunState,
    run_id: Option<RunId>,
    target_ids: BTreeSet<String>,
    seq: u64,
    last_timestamp: Option<DateTime<Utc>>,

    /// Task waiting on an approval signal
    held: Option<(TaskId, TaskSpec, PolicyDecision)>,

    /// Tasks submitted while paused, in submission order
    queue: VecDeque<(TaskId, TaskSpec)>,

    in_flight: usize,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,

    stream_tx: Option<mpsc::UnboundedSender<Event>>,
    stream_rx: Option<mpsc::UnboundedReceiver<Event>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("modules", &self.modules)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(
        policy: PolicyEngine,
        event_log: Arc<dyn EventLog>,
        findings: Arc<dyn FindingStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            policy,
            event_log,
            findings,
            artifacts: None,
            inference: None,
            modules: ModuleRegistry::new(),
            plugins: None,
            bus: EventBus::builder(),
            workers: DEFAULT_WORKERS,
            offline: true,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    fn invalid(&self, operation: &'static str) -> OrchestratorError {
        OrchestratorError::InvalidRunState {
            operation,
            state: self.state.name(),
        }
    }

    /// The run's event stream. Can be taken once, before or during the run.
    pub fn events(&mut self) -> Result<RunEvents> {
        match self.stream_rx.take() {
            Some(rx) => Ok(RunEvents { rx }),
            None => Err(self.invalid("stream events")),
        }
    }

    /// Initialize modules and start the run
    #[instrument(skip(self, targets), fields(targets = targets.len()))]
    pub async fn start_run(&mut self, targets: Vec<TargetProfile>) -> Result<RunId> {
        if self.state != RunState::Idle {
            return Err(self.invalid("start a run"));
        }

        let run_id = Uuid::new_v4();
        self.run_id = Some(run_id);
        self.target_ids = targets.iter().flat_map(|t| t.identifiers()).collect();

        let ctx = ModuleContext {
            run_id,
            targets: targets.clone(),
            dry_run: self.policy.config().dry_run,
            offline: self.offline,
            inference: self.inference.clone(),
        };

        let modules: Vec<(String, Arc<dyn Module>)> = self
            .modules
            .iter()
            .map(|(name, module)| (name.clone(), module.clone()))
            .collect();

        for (name, module) in modules {
            if let Err(e) = module.initialize(&ctx).await {
                error!(%run_id, module = %name, error = %e, "Module failed to initialize");
                self.publish(
                    Event::new(
                        run_id,
                        EventType::ModuleFault,
                        json!({"phase": "initialize", "module": name}),
                    )
                    .with_provenance(Provenance::module(&name))
                    .with_error(e.to_string()),
                )
                .await?;
                self.terminate(RunState::Aborted {
                    reason: e.to_string(),
                })
                .await?;
                return Err(e.into());
            }
            debug!(module = %name, "Module initialized");
        }

        self.state = RunState::Running;
        self.publish(Event::new(run_id, EventType::RunStarted, json!({ "targets": targets })))
            .await?;

        info!(%run_id, "Run started");
        Ok(run_id)
    }

    /// Submit a task. Returns its id; the outcome is reported through events.
    #[instrument(skip(self, task), fields(module = %task.module))]
    pub async fn submit_task(&mut self, task: TaskSpec) -> Result<TaskId> {
        let task_id = Uuid::new_v4();
        match self.state {
            RunState::Running => {
                self.collect_ready().await?;
                self.decide(task_id, task).await?;
            }
            RunState::Paused { .. } => {
                debug!(%task_id, "Run paused, task queued");
                self.queue.push_back((task_id, task));
            }
            _ => return Err(self.invalid("submit a task")),
        }
        Ok(task_id)
    }

    /// Approve the held task and resume the run
    #[instrument(skip(self))]
    pub async fn approve(&mut self, task_id: TaskId) -> Result<()> {
        let (task, decision) = self.take_held(task_id, "approve a task")?;
        let run_id = self.current_run();

        info!(%task_id, "Task approved");
        self.publish(
            Event::new(run_id, EventType::TaskApproved, json!({ "module": task.module }))
                .with_task(task_id)
                .with_provenance(Provenance::operator()),
        )
        .await?;
        self.resume().await?;

        self.dispatch(task_id, task, &decision).await?;
        self.drain_queue().await
    }

    /// Deny the held task and resume the run
    #[instrument(skip(self, reason))]
    pub async fn reject(&mut self, task_id: TaskId, reason: Option<String>) -> Result<()> {
        let (task, _) = self.take_held(task_id, "reject a task")?;
        let run_id = self.current_run();
        let reason = reason.unwrap_or_else(|| reasons::APPROVAL_REJECTED.to_string());

        info!(%task_id, %reason, "Task rejected");
        self.publish(
            Event::new(
                run_id,
                EventType::TaskDenied,
                json!({ "module": task.module, "reason": reason }),
            )
            .with_task(task_id)
            .with_provenance(Provenance::operator()),
        )
        .await?;
        self.resume().await?;

        self.drain_queue().await
    }

    /// Wait for every in-flight task and publish its results
    pub async fn settle(&mut self) -> Result<()> {
        if !matches!(self.state, RunState::Running | RunState::Paused { .. }) {
            return Err(self.invalid("settle"));
        }
        while self.in_flight > 0 {
            let Some(completion) = self.completions_rx.recv().await else {
                break;
            };
            self.in_flight -= 1;
            self.complete(completion).await?;
            if self.state.is_finished() {
                break;
            }
        }
        Ok(())
    }

    /// Settle outstanding work and complete the run
    #[instrument(skip(self))]
    pub async fn finish(&mut self) -> Result<RunState> {
        if self.state != RunState::Running {
            return Err(self.invalid("finish"));
        }
        self.settle().await?;
        self.terminate(RunState::Completed).await?;

        info!(run_id = ?self.run_id, "Run completed");
        Ok(self.state.clone())
    }

    /// Stop the run. Tasks already handed to workers are suppressed.
    #[instrument(skip(self))]
    pub async fn abort(&mut self, reason: &str) -> Result<RunState> {
        if !matches!(self.state, RunState::Running | RunState::Paused { .. }) {
            return Err(self.invalid("abort"));
        }
        warn!(run_id = ?self.run_id, %reason, "Aborting run");

        self.cancelled.store(true, Ordering::SeqCst);
        let run_id = self.current_run();

        // The held task and queued tasks were accepted but never dispatched.
        let mut pending: Vec<(TaskId, TaskSpec)> = Vec::new();
        if let Some((task_id, task, _)) = self.held.take() {
            pending.push((task_id, task));
        }
        pending.extend(self.queue.drain(..));
        if !pending.is_empty() {
            debug!(suppressed = pending.len(), "Pending tasks suppressed");
        }
        for (task_id, task) in pending {
            self.publish(
                Event::new(
                    run_id,
                    EventType::TaskSuppressed,
                    json!({ "module": task.module, "started": false, "task": task }),
                )
                .with_task(task_id),
            )
            .await?;
        }

        while self.in_flight > 0 {
            let Some(completion) = self.completions_rx.recv().await else {
                break;
            };
            self.in_flight -= 1;
            let started = matches!(completion.outcome, Outcome::Finished(_));
            self.publish(
                Event::new(
                    run_id,
                    EventType::TaskSuppressed,
                    json!({ "module": completion.module, "started": started }),
                )
                .with_task(completion.task_id),
            )
            .await?;
        }

        self.terminate(RunState::Aborted {
            reason: reason.to_string(),
        })
        .await?;
        Ok(self.state.clone())
    }

    fn current_run(&self) -> RunId {
        self.run_id.unwrap_or_else(Uuid::nil)
    }

    fn take_held(&mut self, task_id: TaskId, operation: &'static str) -> Result<(TaskSpec, PolicyDecision)> {
        match &self.state {
            RunState::Paused { task_id: held } if *held == task_id => {}
            RunState::Paused { .. } => return Err(OrchestratorError::UnknownTask(task_id)),
            _ => return Err(self.invalid(operation)),
        }
        match self.held.take() {
            Some((_, task, decision)) => Ok((task, decision)),
            None => Err(OrchestratorError::UnknownTask(task_id)),
        }
    }

    async fn resume(&mut self) -> Result<()> {
        self.state = RunState::Running;
        let run_id = self.current_run();
        self.publish(Event::new(run_id, EventType::RunResumed, json!({}))).await
    }

    /// Decide queued tasks until the queue is empty or the run pauses again
    async fn drain_queue(&mut self) -> Result<()> {
        while self.state == RunState::Running {
            let Some((task_id, task)) = self.queue.pop_front() else {
                break;
            };
            self.decide(task_id, task).await?;
        }
        Ok(())
    }

    /// Evaluate a task and act on the decision
    async fn decide(&mut self, task_id: TaskId, task: TaskSpec) -> Result<()> {
        let run_id = self.current_run();
        let decision = self.policy.check(&task);

        self.publish(
            Event::new(
                run_id,
                EventType::TaskProposed,
                json!({ "task": task, "decision": decision }),
            )
            .with_task(task_id),
        )
        .await?;

        if !decision.allowed {
            info!(%task_id, module = %task.module, reason = %decision.reason, "Task denied");
            return self
                .publish(
                    Event::new(
                        run_id,
                        EventType::TaskDenied,
                        json!({ "module": task.module, "reason": decision.reason }),
                    )
                    .with_task(task_id),
                )
                .await;
        }

        if decision.requires_approval {
            info!(%task_id, module = %task.module, "Task awaiting approval");
            self.publish(
                Event::new(
                    run_id,
                    EventType::TaskAwaitingApproval,
                    json!({ "module": task.module, "objective": task.objective }),
                )
                .with_task(task_id),
            )
            .await?;

            self.state = RunState::Paused { task_id };
            self.held = Some((task_id, task, decision));
            return self
                .publish(Event::new(run_id, EventType::RunPaused, json!({})).with_task(task_id))
                .await;
        }

        self.dispatch(task_id, task, &decision).await
    }

    /// Hand an allowed task to its module's worker
    async fn dispatch(&mut self, task_id: TaskId, task: TaskSpec, decision: &PolicyDecision) -> Result<()> {
        let run_id = self.current_run();

        if self.is_excluded(&task.module) {
            return self.skip(task_id, &task.module, MODULE_EXCLUDED).await;
        }
        let Some(module) = self.modules.get(&task.module) else {
            return self.skip(task_id, &task.module, MODULE_NOT_REGISTERED).await;
        };

        let ctx = TaskContext {
            run_id,
            task_id,
            simulate: decision.simulate,
        };
        let module_name = task.module.clone();
        let permits = self.workers.clone();
        let cancelled = self.cancelled.clone();
        let tx = self.completions_tx.clone();

        debug!(%task_id, module = %module_name, simulate = ctx.simulate, "Dispatching task");
        self.in_flight += 1;

        tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            let outcome = if permit.is_err() || cancelled.load(Ordering::SeqCst) {
                Outcome::NotStarted
            } else {
                // A panicking module must still produce a completion.
                let handle = tokio::spawn(async move { module.handle_task(&task, &ctx).await });
                Outcome::Finished(match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("module task failed: {}", e)),
                })
            };
            drop(permit);
            if tx
                .send(Completion {
                    task_id,
                    module: module_name,
                    outcome,
                })
                .is_err()
            {
                debug!(%task_id, "Orchestrator gone, completion dropped");
            }
        });

        Ok(())
    }

    async fn skip(&mut self, task_id: TaskId, module: &str, reason: &str) -> Result<()> {
        debug!(%task_id, %module, %reason, "Task skipped");
        let run_id = self.current_run();
        self.publish(
            Event::new(
                run_id,
                EventType::TaskSkipped,
                json!({ "module": module, "reason": reason }),
            )
            .with_task(task_id),
        )
        .await
    }

    fn is_excluded(&self, module: &str) -> bool {
        self.excluded
            .lock()
            .map(|set| set.contains(module))
            .unwrap_or(false)
    }

    fn exclude(&self, module: &str) {
        if let Ok(mut set) = self.excluded.lock() {
            set.insert(module.to_string());
        }
    }

    /// Publish completions that have already arrived
    async fn collect_ready(&mut self) -> Result<()> {
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.in_flight -= 1;
            self.complete(completion).await?;
        }
        Ok(())
    }

    /// Publish what a module produced for one task
    async fn complete(&mut self, completion: Completion) -> Result<()> {
        let run_id = self.current_run();
        let Completion {
            task_id,
            module,
            outcome,
        } = completion;

        let emissions = match outcome {
            Outcome::NotStarted => {
                return self
                    .publish(
                        Event::new(
                            run_id,
                            EventType::TaskSuppressed,
                            json!({ "module": module, "started": false }),
                        )
                        .with_task(task_id),
                    )
                    .await;
            }
            Outcome::Finished(Err(e)) => {
                error!(%task_id, %module, error = %e, "Module failed");
                self.exclude(&module);
                return self
                    .publish(
                        Event::new(
                            run_id,
                            EventType::ModuleFault,
                            json!({ "phase": "handle_task", "module": module }),
                        )
                        .with_task(task_id)
                        .with_provenance(Provenance::module(&module))
                        .with_error(format!("{:#}", e)),
                    )
                    .await;
            }
            Outcome::Finished(Ok(emissions)) => emissions,
        };

        self.publish(
            Event::new(
                run_id,
                EventType::TaskExecuted,
                json!({ "module": module, "emissions": emissions.len() }),
            )
            .with_task(task_id)
            .with_provenance(Provenance::module(&module)),
        )
        .await?;

        for emission in emissions {
            self.emit(task_id, &module, emission).await?;
            if self.state.is_finished() {
                break;
            }
        }
        Ok(())
    }

    /// Re-publish one emission as an orchestrator event
    async fn emit(&mut self, task_id: TaskId, module: &str, emission: Emission) -> Result<()> {
        let run_id = self.current_run();
        let provenance = Provenance::module(module);

        match emission {
            Emission::Event { kind, data } => {
                self.publish(
                    Event::new(run_id, EventType::ModuleEmitted, json!({ "kind": kind, "data": data }))
                        .with_task(task_id)
                        .with_provenance(provenance),
                )
                .await
            }
            Emission::Finding(finding) => {
                if !finding.references_any(self.target_ids.iter().map(String::as_str)) {
                    warn!(finding = %finding.id, %module, "Finding references no target of the run");
                    return self
                        .publish(
                            Event::new(
                                run_id,
                                EventType::FindingRejected,
                                json!({ "finding": finding }),
                            )
                            .with_task(task_id)
                            .with_provenance(provenance)
                            .with_error("finding references no target of the run"),
                        )
                        .await;
                }

                self.publish(
                    Event::new(run_id, EventType::FindingRecorded, json!({ "finding": finding }))
                        .with_task(task_id)
                        .with_provenance(provenance),
                )
                .await?;

                if let Err(e) = self.findings.add_finding(run_id, &finding).await {
                    return Err(self.write_failed(e).await);
                }
                Ok(())
            }
            Emission::Artifact { artifact, content } => {
                if let Some(store) = self.artifacts.clone() {
                    match store.add(&artifact, &content).await {
                        Ok(()) => {}
                        Err(e @ StorageError::Write(_)) => return Err(self.write_failed(e).await),
                        Err(e) => {
                            self.exclude(module);
                            return self
                                .publish(
                                    Event::new(
                                        run_id,
                                        EventType::ModuleFault,
                                        json!({ "phase": "emit", "module": module, "artifact": artifact.path }),
                                    )
                                    .with_task(task_id)
                                    .with_provenance(provenance)
                                    .with_error(e.to_string()),
                                )
                                .await;
                        }
                    }
                }

                self.publish(
                    Event::new(run_id, EventType::ArtifactStored, json!({ "artifact": artifact }))
                        .with_task(task_id)
                        .with_provenance(provenance),
                )
                .await
            }
        }
    }

    /// Publish a terminal event and close the event stream
    async fn terminate(&mut self, state: RunState) -> Result<()> {
        let run_id = self.current_run();
        let event = match &state {
            RunState::Aborted { reason } => {
                self.cancelled.store(true, Ordering::SeqCst);
                Event::new(run_id, EventType::RunAborted, json!({ "reason": reason }))
            }
            _ => Event::new(run_id, EventType::RunCompleted, json!({})),
        };
        self.state = state;
        self.publish(event).await?;
        self.stream_tx = None;
        Ok(())
    }

    /// Persist, fan out and stream an event, followed by any faults it caused
    async fn publish(&mut self, event: Event) -> Result<()> {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let event = self.stamp(event);

            if let Err(e) = self.event_log.append(&event).await {
                return Err(self.write_failed(e).await);
            }

            let failures = self.bus.publish(&event);
            self.forward(&event);

            if event.event_type == EventType::HandlerFault {
                // Failures while reporting a failure are only logged.
                continue;
            }
            for failure in failures {
                pending.push_back(self.fault_event(&event, failure));
            }
        }
        Ok(())
    }

    fn fault_event(&self, cause: &Event, failure: HandlerFailure) -> Event {
        match failure.handler.strip_prefix(MODULE_HANDLER_PREFIX) {
            Some(module) => {
                warn!(%module, event_type = %cause.event_type, "Module on_event failed, excluding module");
                self.exclude(module);
                Event::new(
                    cause.run_id,
                    EventType::ModuleFault,
                    json!({ "phase": "on_event", "module": module, "event_id": failure.event_id }),
                )
                .with_provenance(Provenance::module(module))
                .with_error(failure.error)
            }
            None => Event::new(
                cause.run_id,
                EventType::HandlerFault,
                json!({
                    "handler": failure.handler,
                    "event_id": failure.event_id,
                    "event_type": failure.event_type,
                }),
            )
            .with_error(failure.error),
        }
    }

    /// Assign the next sequence number and a non-decreasing timestamp
    fn stamp(&mut self, event: Event) -> Event {
        self.seq += 1;
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        event.stamped(self.seq, timestamp)
    }

    fn forward(&self, event: &Event) {
        if let Some(tx) = &self.stream_tx {
            // Nobody listening is fine.
            let _ = tx.send(event.clone());
        }
    }

    /// Abort after a persistence failure. The abort itself is recorded only
    /// if the log accepts it.
    async fn write_failed(&mut self, e: StorageError) -> OrchestratorError {
        error!(run_id = ?self.run_id, error = %e, "Persistence failed, aborting run");

        self.cancelled.store(true, Ordering::SeqCst);
        self.queue.clear();
        self.held = None;

        let reason = format!("write_failed: {}", e);
        self.state = RunState::Aborted {
            reason: reason.clone(),
        };

        let event = self.stamp(Event::new(
            self.current_run(),
            EventType::RunAborted,
            json!({ "reason": reason }),
        ));
        if self.event_log.append(&event).await.is_ok() {
            self.forward(&event);
        }
        self.stream_tx = None;

        OrchestratorError::Write(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyConfig;
    use crate::modules::ScriptedModule;
    use crate::storage::{MemoryEventLog, MemoryFindingStore};

    fn orchestrator() -> (Orchestrator, Arc<MemoryEventLog>) {
        let log = Arc::new(MemoryEventLog::new());
        let orch = Orchestrator::builder(
            PolicyEngine::new(PolicyConfig::default()),
            log.clone(),
            Arc::new(MemoryFindingStore::new()),
        )
        .module(ScriptedModule::new("recon"))
        .build();
        (orch, log)
    }

    fn task() -> TaskSpec {
        TaskSpec::new("recon", "enumerate")
            .with_context("target", "10.0.0.5")
            .with_context("tier", "low")
    }

    #[tokio::test]
    async fn test_operations_require_running_state() {
        let (mut orch, _) = orchestrator();

        let err = orch.submit_task(task()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRunState { state: "idle", .. }));
        assert!(orch.finish().await.is_err());
        assert_eq!(*orch.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let (mut orch, log) = orchestrator();
        orch.start_run(vec![TargetProfile::new("host", "10.0.0.5")])
            .await
            .unwrap();
        orch.submit_task(task()).await.unwrap();
        orch.submit_task(task()).await.unwrap();
        orch.finish().await.unwrap();

        let events = log.snapshot();
        assert!(events.len() >= 6);
        for pair in events.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[tokio::test]
    async fn test_events_stream_taken_once() {
        let (mut orch, _) = orchestrator();
        let stream = orch.events().unwrap();
        assert!(orch.events().is_err());

        orch.start_run(Vec::new()).await.unwrap();
        orch.finish().await.unwrap();

        let events = stream.collect().await;
        assert_eq!(events.first().map(|e| e.event_type), Some(EventType::RunStarted));
        assert_eq!(events.last().map(|e| e.event_type), Some(EventType::RunCompleted));
    }
}
