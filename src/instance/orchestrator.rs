//! Orchestrator instance: the single-writer actor that owns one run.
//!
//! The instance alternates between two suspension points:
//! - waiting on the mailbox until there is something to do
//! - waiting on dispatched steps, while still applying incoming events
//!
//! Every mutation of run state happens on the instance's own task, so event
//! handlers and the plan/dispatch/persist/compact cycle never interleave.
//! The instance ends either stopped, with a [`RunSummary`], or restarted,
//! handing a [`Checkpoint`] and its mailbox to a successor.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinSet;

use crate::config::AgentConfig;
use crate::core::artifact::ArtifactSet;
use crate::core::dag::{self, PlanGraph};
use crate::core::history::{EntryKind, HistoryEntry, HistoryLog};
use crate::core::plan::{Plan, PlanMode, PlanStep, StepStatus};
use crate::core::task::{Task, TaskId};
use crate::instance::checkpoint::{
    Checkpoint, Cursors, InstanceId, RunStats, RunSummary, ShutdownMode,
};
use crate::instance::events::{Envelope, Event, Mailbox};
use crate::instance::phase::{InstancePhase, PhaseTracker};
use crate::memory::compactor::MemoryCompactor;
use crate::orchestration::dispatcher::{Dispatcher, StepFailure, StepOutcome, StepReport};
use crate::orchestration::planner::Planner;
use crate::orchestration::tools::ToolRegistry;
use crate::state::snapshot::Snapshot;
use crate::state::store::SnapshotStore;
use crate::util::digest;
use crate::{Error, Result};

/// Completed plans kept for inspection.
pub const MAX_RETAINED_PLANS: usize = 16;

/// How an instance ended.
#[derive(Debug)]
pub enum RunOutcome {
    Stopped(RunSummary),
    /// Continue as new: a successor starts from `checkpoint` and keeps
    /// receiving events through `mailbox`.
    Restarted {
        checkpoint: Checkpoint,
        mailbox: Mailbox,
    },
}

/// Collaborators shared by every instance of a run.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<ToolRegistry>,
    pub planner: Planner,
    pub compactor: MemoryCompactor,
    pub store: Option<Arc<dyn SnapshotStore>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("tools", &self.registry.tool_names())
            .field("planner", &self.planner)
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl Services {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            planner: Planner::new(),
            compactor: MemoryCompactor::new(),
            store: None,
        }
    }

    pub fn with_planner(mut self, planner: Planner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_compactor(mut self, compactor: MemoryCompactor) -> Self {
        self.compactor = compactor;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// What the run loop does after waking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Stop,
    Restart,
    Task,
}

pub struct Orchestrator {
    instance_id: InstanceId,
    generation: u64,
    config: Option<Arc<AgentConfig>>,
    dispatcher: Option<Dispatcher>,
    services: Services,
    pending: VecDeque<Task>,
    active_plan: Option<Plan>,
    plan_overrides: BTreeMap<TaskId, Plan>,
    plans: Vec<Plan>,
    history: HistoryLog,
    artifacts: ArtifactSet,
    cursors: Cursors,
    stats: RunStats,
    phase: PhaseTracker,
    shutdown: Option<ShutdownMode>,
    restart_signalled: bool,
    snapshot_sequence: u64,
    mailbox: Mailbox,
    mailbox_closed: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("instance_id", &self.instance_id)
            .field("generation", &self.generation)
            .field("phase", &self.phase.current())
            .field("pending", &self.pending.len())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an instance from `checkpoint`, receiving events from `mailbox`.
    ///
    /// Steps of a carried-forward plan that were dispatched but never
    /// resolved are put back to pending and run again.
    pub fn new(checkpoint: Checkpoint, mailbox: Mailbox, services: Services) -> Self {
        let Checkpoint {
            instance_id,
            generation,
            config,
            pending,
            active_plan,
            plan_overrides,
            plans,
            artifacts,
            cursors,
            mut stats,
            history,
            history_next_seq,
            snapshot_sequence,
            shutdown,
        } = checkpoint;

        let config = config.map(Arc::new);
        let dispatcher = config
            .as_ref()
            .map(|c| Dispatcher::new(services.registry.clone(), c.clone()));
        let phase = PhaseTracker::new(if config.is_some() {
            InstancePhase::Idle
        } else {
            InstancePhase::AwaitingConfiguration
        });
        let active_plan = active_plan.map(|mut plan| {
            for step in &mut plan.steps {
                if matches!(step.status, StepStatus::Running | StepStatus::Ready) {
                    step.status = StepStatus::Pending;
                }
            }
            plan
        });
        stats.generation = generation;

        Self {
            instance_id,
            generation,
            config,
            dispatcher,
            services,
            pending,
            active_plan,
            plan_overrides,
            plans,
            history: HistoryLog::from_parts(history, history_next_seq),
            artifacts,
            cursors,
            stats,
            phase,
            shutdown,
            restart_signalled: false,
            snapshot_sequence,
            mailbox,
            mailbox_closed: false,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn phase(&self) -> InstancePhase {
        self.phase.current()
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Serializable projection of the current state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.snapshot_sequence, self.checkpoint_state())
    }

    /// Drive the instance until it stops or restarts.
    ///
    /// # Errors
    /// Only invariant violations (an invalid phase transition) end the run
    /// with an error. Step, plan and persistence failures are recorded in
    /// history and the run continues.
    pub async fn run(mut self) -> Result<RunOutcome> {
        tracing::info!(
            instance = %self.instance_id,
            generation = self.generation,
            pending = self.pending.len(),
            configured = self.config.is_some(),
            "Orchestrator started"
        );
        loop {
            match self.wait_for_wake().await {
                Wake::Stop => return self.stop().await.map(RunOutcome::Stopped),
                Wake::Restart => return self.checkpoint_for_restart().await,
                Wake::Task => self.process_head_task().await?,
            }
        }
    }

    // Waiting

    async fn wait_for_wake(&mut self) -> Wake {
        loop {
            self.apply_queued_events();
            if let Some(wake) = self.wake_condition() {
                return wake;
            }
            match self.mailbox.recv().await {
                Some(envelope) => self.apply(envelope),
                None => self.mailbox_gone(),
            }
        }
    }

    fn apply_queued_events(&mut self) {
        while !self.mailbox_closed {
            match self.mailbox.try_recv() {
                Ok(envelope) => self.apply(envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.mailbox_gone(),
            }
        }
    }

    fn wake_condition(&self) -> Option<Wake> {
        if let Some(mode) = self.shutdown {
            if mode == ShutdownMode::Immediate || self.config.is_none() || self.pending.is_empty() {
                return Some(Wake::Stop);
            }
        }
        self.config.as_ref()?;
        if self.restart_due() {
            return Some(Wake::Restart);
        }
        if !self.pending.is_empty() {
            return Some(Wake::Task);
        }
        None
    }

    fn restart_due(&self) -> bool {
        !self.restart_signalled
            && self
                .config
                .as_ref()
                .is_some_and(|c| self.stats.events_since_restart >= c.restart_threshold)
    }

    /// New steps are not started once an immediate shutdown was requested
    /// or the restart threshold is reached.
    fn dispatch_halted(&self) -> bool {
        self.shutdown == Some(ShutdownMode::Immediate) || self.restart_due()
    }

    fn mailbox_gone(&mut self) {
        if self.mailbox_closed {
            return;
        }
        self.mailbox_closed = true;
        tracing::info!(instance = %self.instance_id, "All handles dropped, draining");
        self.request_shutdown(ShutdownMode::Drain);
    }

    fn transition(&mut self, target: InstancePhase) -> Result<()> {
        self.phase.transition(target)
    }

    // Event handlers

    fn apply(&mut self, envelope: Envelope) {
        let name = envelope.event.name();
        let result = self.handle_event(&envelope.event);
        self.stats.events_since_restart += 1;
        match &result {
            Ok(()) => tracing::debug!(instance = %self.instance_id, event = name, "Event applied"),
            Err(e) => tracing::warn!(
                instance = %self.instance_id,
                event = name,
                error = %e,
                "Event rejected"
            ),
        }
        envelope.acknowledge(result);
    }

    fn handle_event(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::Configure(config) => self.configure(config.clone()),
            Event::EnqueueTask(task) => self.enqueue_task(task.clone()),
            Event::InjectMemory(entries) => self.inject_memory(entries.clone()),
            Event::SetPlan(plan) => self.set_plan(plan.clone()),
            Event::Shutdown { drain } => {
                let mode = if *drain {
                    ShutdownMode::Drain
                } else {
                    ShutdownMode::Immediate
                };
                self.request_shutdown(mode);
                Ok(())
            }
        }
    }

    fn configure(&mut self, config: AgentConfig) -> Result<()> {
        config.validate()?;
        let config = Arc::new(config);
        self.dispatcher = Some(Dispatcher::new(self.services.registry.clone(), config.clone()));
        self.history.append(
            HistoryEntry::new(EntryKind::Metadata, "configure", digest(config.as_ref()))
                .with_detail(config.planner_mode.to_string()),
        );
        tracing::info!(
            instance = %self.instance_id,
            agent = %config.agent_name,
            planner = %config.planner_mode,
            "Configuration applied"
        );
        self.config = Some(config);
        if self.phase.current() == InstancePhase::AwaitingConfiguration {
            self.transition(InstancePhase::Idle)?;
        }
        Ok(())
    }

    fn enqueue_task(&mut self, task: Task) -> Result<()> {
        if task.id.as_str().trim().is_empty() {
            return Err(Error::Validation("task id must not be empty".into()));
        }
        if self.pending.iter().any(|t| t.id == task.id) {
            return Err(Error::Validation(format!("task {} is already pending", task.id)));
        }
        self.history.append(
            HistoryEntry::new(EntryKind::Metadata, "enqueue_task", digest(&task))
                .with_detail(task.id.to_string())
                .with_tag(&task.kind.to_string()),
        );
        tracing::info!(instance = %self.instance_id, task = %task.id, kind = %task.kind, "Task enqueued");
        self.pending.push_back(task);
        Ok(())
    }

    fn inject_memory(&mut self, entries: Vec<HistoryEntry>) -> Result<()> {
        if let Some(bad) = entries.iter().find(|e| e.name.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "injected entry at seq {} has an empty name",
                bad.seq
            )));
        }
        let inputs = digest(&entries);
        let count = self.history.inject(entries);
        self.history.append(
            HistoryEntry::new(EntryKind::Metadata, "inject_memory", inputs)
                .with_detail(format!("{} entries", count)),
        );
        tracing::info!(instance = %self.instance_id, count, "Memory injected");
        Ok(())
    }

    fn set_plan(&mut self, mut plan: Plan) -> Result<()> {
        if !self.pending.iter().any(|t| t.id == plan.task_id) {
            return Err(Error::Validation(format!(
                "no pending task {} to attach a plan to",
                plan.task_id
            )));
        }
        if self
            .active_plan
            .as_ref()
            .is_some_and(|active| active.task_id == plan.task_id)
        {
            return Err(Error::Validation(format!(
                "plan for task {} is already executing",
                plan.task_id
            )));
        }
        PlanGraph::build(&plan)?;

        plan.mode = PlanMode::Manual;
        plan.reset();
        self.history.append(
            HistoryEntry::new(EntryKind::Metadata, "set_plan", digest(&plan.steps))
                .with_detail(plan.task_id.to_string()),
        );
        tracing::info!(
            instance = %self.instance_id,
            task = %plan.task_id,
            steps = plan.steps.len(),
            "Plan override stored"
        );
        self.plan_overrides.insert(plan.task_id.clone(), plan);
        Ok(())
    }

    fn request_shutdown(&mut self, mode: ShutdownMode) {
        let merged = self.shutdown.map_or(mode, |current| current.merge(mode));
        if self.shutdown == Some(merged) {
            return;
        }
        let detail = match merged {
            ShutdownMode::Immediate => "immediate",
            ShutdownMode::Drain => "drain",
        };
        self.history.append(
            HistoryEntry::new(EntryKind::Metadata, "shutdown", digest(&merged)).with_detail(detail),
        );
        tracing::info!(instance = %self.instance_id, mode = detail, "Shutdown requested");
        self.shutdown = Some(merged);
    }

    // Plan, dispatch, persist, compact

    async fn process_head_task(&mut self) -> Result<()> {
        let Some(task) = self.pending.front().cloned() else {
            return Ok(());
        };
        let Some(config) = self.config.clone() else {
            return Ok(());
        };

        self.transition(InstancePhase::Planning)?;
        match self.obtain_plan(&task, &config).await {
            Ok(()) => {
                self.transition(InstancePhase::Dispatching)?;
                self.dispatch_active_plan().await;
                self.transition(InstancePhase::Persisting)?;
                let finished = self.finish_plan_if_complete();
                self.persist_and_compact(finished).await
            }
            Err(error) => {
                self.reject_task(&task, &error);
                self.transition(InstancePhase::Persisting)?;
                self.persist_and_compact(true).await
            }
        }
    }

    /// Make the head task's plan active: a carried-forward plan, an
    /// override from `set_plan`, or a fresh one from the planner.
    async fn obtain_plan(&mut self, task: &Task, config: &AgentConfig) -> Result<()> {
        if let Some(active) = &self.active_plan {
            if active.task_id == task.id {
                tracing::info!(
                    instance = %self.instance_id,
                    task = %task.id,
                    plan = %active.id,
                    "Resuming partially resolved plan"
                );
                return Ok(());
            }
            tracing::warn!(plan = %active.id, "Dropping active plan of a task no longer queued");
            self.active_plan = None;
        }

        let mut plan = match self.plan_overrides.remove(&task.id) {
            Some(plan) => plan,
            None => {
                self.services
                    .planner
                    .build_plan(task, config.planner_mode, config, &self.artifacts)
                    .await?
            }
        };

        self.cursors.plans_created += 1;
        plan.id = format!("plan-{}-{}", task.id, self.cursors.plans_created);
        plan.created_at_seq = self.history.next_seq();
        self.history.append(
            HistoryEntry::new(EntryKind::Plan, &plan.id, digest(task))
                .with_result(digest(&plan.steps))
                .with_tag(&plan.mode.to_string()),
        );
        tracing::info!(
            instance = %self.instance_id,
            task = %task.id,
            plan = %plan.id,
            mode = %plan.mode,
            steps = ?plan.step_names(),
            "Plan ready"
        );
        self.cursors.step_results.clear();
        self.active_plan = Some(plan);
        Ok(())
    }

    fn reject_task(&mut self, task: &Task, error: &Error) {
        tracing::warn!(instance = %self.instance_id, task = %task.id, error = %error, "Plan rejected");
        self.history.append(
            HistoryEntry::new(EntryKind::Error, "plan", digest(task))
                .with_error(error.to_string())
                .with_detail(task.id.to_string())
                .with_tag(error.tag()),
        );
        self.stats.errors += 1;
        self.stats.tasks_failed += 1;
        self.pending.retain(|t| t.id != task.id);
        self.cursors.last_task_id = Some(task.id.clone());
    }

    async fn dispatch_active_plan(&mut self) {
        let mut in_flight: JoinSet<StepReport> = JoinSet::new();
        loop {
            if !self.dispatch_halted() {
                self.start_ready_steps(&mut in_flight);
            }
            if in_flight.is_empty() {
                break;
            }
            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(report)) => self.apply_report(report).await,
                    Some(Err(e)) => tracing::error!(
                        instance = %self.instance_id,
                        error = %e,
                        "Step task ended abnormally"
                    ),
                    None => break,
                },
                envelope = self.mailbox.recv(), if !self.mailbox_closed => match envelope {
                    Some(envelope) => self.apply(envelope),
                    None => self.mailbox_gone(),
                },
            }
        }
        self.fail_orphaned_steps().await;
    }

    /// Start ready steps of the active plan, up to the planning interval.
    fn start_ready_steps(&mut self, in_flight: &mut JoinSet<StepReport>) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            return;
        };
        let limit = self
            .config
            .as_ref()
            .and_then(|c| c.planning_interval)
            .unwrap_or(usize::MAX)
            .max(1);
        let Some(plan) = self.active_plan.as_mut() else {
            return;
        };

        let propagated: Vec<(String, String)> = dag::propagate_failures(plan)
            .into_iter()
            .map(|name| {
                let error = plan
                    .step(&name)
                    .and_then(|s| s.last_error.clone())
                    .unwrap_or_default();
                (name, error)
            })
            .collect();

        let capacity = limit.saturating_sub(in_flight.len());
        let mut started = Vec::new();
        for ready in dag::ready_steps(plan).into_iter().take(capacity) {
            let mut step = ready.clone();
            step.inputs = ready.resolved_inputs(&self.cursors.step_results);
            if let Some(s) = plan.step_mut(&ready.name) {
                s.status = StepStatus::Running;
            }
            in_flight.spawn(run_step(dispatcher.clone(), step));
            started.push(ready.name);
        }
        let plan_id = plan.id.clone();

        for (name, error) in propagated {
            self.history.append(
                HistoryEntry::new(EntryKind::Error, &name, digest(&plan_id))
                    .with_error(error)
                    .with_tag("propagated"),
            );
            self.stats.steps_failed += 1;
            self.stats.events_since_restart += 1;
            tracing::debug!(plan = %plan_id, step = %name, "Step failed through a dependency");
        }
        if !started.is_empty() {
            tracing::debug!(
                instance = %self.instance_id,
                plan = %plan_id,
                steps = ?started,
                "Steps dispatched"
            );
        }
    }

    async fn apply_report(&mut self, report: StepReport) {
        self.stats.events_since_restart += 1;
        let Some(plan) = self.active_plan.as_mut() else {
            tracing::warn!(step = %report.step_name, "Report arrived without an active plan");
            return;
        };
        let plan_id = plan.id.clone();
        let Some(step) = plan.step_mut(&report.step_name) else {
            tracing::warn!(plan = %plan_id, step = %report.step_name, "Report for unknown step");
            return;
        };

        step.attempts = report.attempt_count();
        let inputs_digest = digest(&step.resolved_inputs(&self.cursors.step_results));
        let outputs = step.outputs.clone();

        for attempt in report.retried_attempts() {
            self.history.append(
                HistoryEntry::new(EntryKind::Observation, &report.step_name, inputs_digest.clone())
                    .with_error(attempt.error.clone().unwrap_or_default())
                    .with_latency(attempt.latency_ms)
                    .with_detail(format!("attempt {}", attempt.attempt))
                    .with_tag("retry"),
            );
        }

        match report.outcome {
            StepOutcome::Succeeded { output, latency_ms } => {
                step.status = StepStatus::Succeeded;
                step.last_error = None;
                let result_digest = digest(&output);
                self.history.append(
                    HistoryEntry::new(EntryKind::Step, &report.step_name, inputs_digest)
                        .with_result(result_digest.clone())
                        .with_latency(latency_ms),
                );
                for name in &outputs {
                    self.artifacts
                        .register_output(name, &plan_id, &report.step_name, &output, &result_digest);
                }
                self.cursors.step_results.insert(report.step_name.clone(), output);
                self.stats.steps_executed += 1;
                tracing::debug!(plan = %plan_id, step = %report.step_name, latency_ms, "Step resolved");
            }
            StepOutcome::Failed { failure, rejected } => {
                step.status = StepStatus::Failed;
                step.last_error = Some(failure.message.clone());
                let mut entry = HistoryEntry::new(EntryKind::Error, &report.step_name, inputs_digest)
                    .with_error(failure.message.clone())
                    .with_tag(&failure.tag);
                if let Some(last) = report.attempts.last() {
                    entry = entry.with_latency(last.latency_ms);
                }
                if rejected {
                    entry = entry.with_tag("rejected");
                }
                self.history.append(entry);
                self.stats.steps_failed += 1;
                self.stats.errors += 1;
                tracing::warn!(
                    plan = %plan_id,
                    step = %report.step_name,
                    tag = %failure.tag,
                    error = %failure.message,
                    "Step failed"
                );
            }
        }

        self.snapshot_on_step_cadence().await;
    }

    /// Resolve steps still marked running after every dispatched step has
    /// reported back.
    async fn fail_orphaned_steps(&mut self) {
        let orphaned: Vec<String> = self
            .active_plan
            .as_ref()
            .map(|plan| {
                plan.steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Running)
                    .map(|s| s.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        for name in orphaned {
            let report = StepReport {
                step_name: name,
                outcome: StepOutcome::Failed {
                    failure: StepFailure {
                        tag: "InternalError".to_string(),
                        message: "step task ended without a report".to_string(),
                        retryable: false,
                    },
                    rejected: false,
                },
                attempts: Vec::new(),
            };
            self.apply_report(report).await;
        }
    }

    /// Retire the active plan once every step is terminal. Returns whether
    /// the head task finished.
    fn finish_plan_if_complete(&mut self) -> bool {
        if !self.active_plan.as_ref().is_some_and(Plan::is_complete) {
            return false;
        }
        let Some(plan) = self.active_plan.take() else {
            return false;
        };
        let task_id = plan.task_id.clone();
        self.pending.retain(|t| t.id != task_id);

        if plan.all_succeeded() {
            self.stats.tasks_completed += 1;
            self.history.append(
                HistoryEntry::new(EntryKind::Metadata, "task_completed", digest(&task_id))
                    .with_result(digest(&plan.steps))
                    .with_detail(task_id.to_string()),
            );
            tracing::info!(instance = %self.instance_id, task = %task_id, plan = %plan.id, "Task completed");
        } else {
            self.stats.tasks_failed += 1;
            let failed: Vec<&str> = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .map(|s| s.name.as_str())
                .collect();
            self.history.append(
                HistoryEntry::new(EntryKind::Metadata, "task_failed", digest(&task_id))
                    .with_result(digest(&plan.steps))
                    .with_detail(format!("{}: {}", task_id, failed.join(", "))),
            );
            tracing::warn!(
                instance = %self.instance_id,
                task = %task_id,
                plan = %plan.id,
                failed = ?failed,
                "Task failed"
            );
        }

        self.cursors.last_task_id = Some(task_id);
        self.cursors.step_results.clear();
        self.plans.push(plan);
        if self.plans.len() > MAX_RETAINED_PLANS {
            let excess = self.plans.len() - MAX_RETAINED_PLANS;
            self.plans.drain(..excess);
        }
        true
    }

    async fn persist_and_compact(&mut self, task_finished: bool) -> Result<()> {
        let Some(config) = self.config.clone() else {
            return self.transition(InstancePhase::Idle);
        };
        if task_finished && config.snapshot_interval.is_none() {
            self.save_snapshot().await;
        }
        if MemoryCompactor::needs_compaction(&self.history, &config) {
            self.transition(InstancePhase::Compacting)?;
            self.compact(&config);
        }
        self.transition(InstancePhase::Idle)
    }

    fn compact(&mut self, config: &AgentConfig) {
        match self.services.compactor.maybe_compact(&mut self.history, config) {
            Ok(Some(report)) => {
                self.stats.compactions += 1;
                tracing::debug!(
                    instance = %self.instance_id,
                    entries_before = report.entries_before,
                    entries_after = report.entries_after,
                    "Compaction applied"
                );
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(instance = %self.instance_id, error = %error, "Compaction failed");
                self.history.append(
                    HistoryEntry::new(EntryKind::Error, "compaction", digest(&self.history.len()))
                        .with_error(error.to_string())
                        .with_tag(error.tag()),
                );
                self.stats.errors += 1;
            }
        }
    }

    async fn snapshot_on_step_cadence(&mut self) {
        let Some(interval) = self.config.as_ref().and_then(|c| c.snapshot_interval) else {
            return;
        };
        let since = self.stats.steps_resolved() - self.stats.last_snapshot_step;
        if interval > 0 && since >= interval {
            self.save_snapshot().await;
        }
    }

    /// Save a snapshot if a store is configured. A failed save degrades
    /// durability but never stops the run.
    async fn save_snapshot(&mut self) {
        let Some(store) = self.services.store.clone() else {
            return;
        };
        self.snapshot_sequence += 1;
        self.stats.last_snapshot_step = self.stats.steps_resolved();
        let sequence = self.snapshot_sequence;
        let snapshot = Snapshot::new(sequence, self.checkpoint_state());

        match store.save(&snapshot).await {
            Ok(()) => {
                self.stats.snapshots_saved += 1;
                tracing::debug!(instance = %self.instance_id, sequence, "Snapshot saved");
            }
            Err(error) => {
                tracing::warn!(
                    instance = %self.instance_id,
                    sequence,
                    error = %error,
                    "Snapshot save failed, durability degraded"
                );
                self.history.append(
                    HistoryEntry::new(EntryKind::Error, "snapshot", digest(&sequence))
                        .with_error(error.to_string())
                        .with_tag("PersistenceError"),
                );
                self.stats.errors += 1;
                self.stats.degraded_durability = true;
            }
        }
    }

    // Termination

    async fn stop(mut self) -> Result<RunSummary> {
        self.transition(InstancePhase::ShuttingDown)?;
        tracing::info!(
            instance = %self.instance_id,
            pending = self.pending.len(),
            "Shutting down"
        );
        self.save_snapshot().await;
        self.transition(InstancePhase::Stopped)?;
        tracing::info!(
            instance = %self.instance_id,
            generation = self.generation,
            steps_executed = self.stats.steps_executed,
            steps_failed = self.stats.steps_failed,
            tasks_completed = self.stats.tasks_completed,
            "Orchestrator stopped"
        );
        Ok(self.summary())
    }

    async fn checkpoint_for_restart(mut self) -> Result<RunOutcome> {
        self.transition(InstancePhase::CheckpointingForRestart)?;
        self.restart_signalled = true;
        let next_generation = self.generation + 1;
        tracing::info!(
            instance = %self.instance_id,
            generation = self.generation,
            events = self.stats.events_since_restart,
            mid_plan = self.active_plan.is_some(),
            "Restart threshold reached, checkpointing"
        );
        self.history.append(
            HistoryEntry::new(EntryKind::Metadata, "restart", digest(&next_generation))
                .with_detail(format!("generation {}", next_generation)),
        );
        self.save_snapshot().await;

        let mut checkpoint = self.checkpoint_state();
        checkpoint.generation = next_generation;
        checkpoint.stats.generation = next_generation;
        checkpoint.stats.events_since_restart = 0;
        checkpoint.history.clear();
        checkpoint.shutdown = self.shutdown;

        self.transition(InstancePhase::Restarted)?;
        Ok(RunOutcome::Restarted {
            checkpoint,
            mailbox: self.mailbox,
        })
    }

    fn checkpoint_state(&self) -> Checkpoint {
        Checkpoint {
            instance_id: self.instance_id.clone(),
            generation: self.generation,
            config: self.config.as_deref().cloned(),
            pending: self.pending.clone(),
            active_plan: self.active_plan.clone(),
            plan_overrides: self.plan_overrides.clone(),
            plans: self.plans.clone(),
            artifacts: self.artifacts.clone(),
            cursors: self.cursors.clone(),
            stats: self.stats.clone(),
            history: self.history.entries().to_vec(),
            history_next_seq: self.history.next_seq(),
            snapshot_sequence: self.snapshot_sequence,
            shutdown: None,
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            instance_id: self.instance_id.clone(),
            generation: self.generation,
            stats: self.stats.clone(),
            artifacts: self.artifacts.clone(),
            plans: self.plans.clone(),
            history: self.history.entries().to_vec(),
            pending: self.pending.iter().map(|t| t.id.clone()).collect(),
        }
    }
}

/// Run one step on the dispatcher, turning a panicking tool into a failure.
async fn run_step(dispatcher: Dispatcher, step: PlanStep) -> StepReport {
    match AssertUnwindSafe(dispatcher.execute(&step)).catch_unwind().await {
        Ok(report) => report,
        Err(_) => {
            tracing::error!(step = %step.name, "Step panicked");
            StepReport {
                step_name: step.name.clone(),
                outcome: StepOutcome::Failed {
                    failure: StepFailure {
                        tag: "InternalError".to_string(),
                        message: "step panicked".to_string(),
                        retryable: false,
                    },
                    rejected: false,
                },
                attempts: Vec::new(),
            }
        }
    }
}
