//! Workflow engine: the run-level state machine.
//!
//! The engine owns one active run at a time. Each call to [`WorkflowEngine::run_phase`]
//! goes through the same steps:
//!
//! 1. PRE checkpoint (reused when a failed attempt already wrote one)
//! 2. resolve the phase's agents and dependency map
//! 3. dispatch the swarm
//! 4. fold outcomes into agent states, artifacts and usage
//! 5. governance evaluation
//! 6. mark completed, advance, POST checkpoint
//!
//! `RunState` is only mutated by the task holding the phase lock. Run state is
//! written to the store after every mutation so that `resume` can pick a run
//! up again in a new process.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentExecutor, ExitStatus, Outcome};
use crate::budget::{BudgetEnforcer, BudgetReport, ScopeContext};
use crate::cache::CacheStats;
use crate::checkpoint::{
    Checkpoint, CheckpointDiff, CheckpointKind, CheckpointManager, CheckpointSummary,
};
use crate::config::MaestroToml;
use crate::errors::{EngineError, SwarmError, TransitionRejected, WorkflowError};
use crate::events::{EngineEvent, EventSender, emit};
use crate::governance::{AlwaysPass, GovernanceEvaluator, GovernanceResult};
use crate::phase::{PhaseDefinition, PhaseManager, WorkflowDefinition};
use crate::retry::RetryExecutor;
use crate::state::{
    AgentState, ArchiveRecord, Artifact, PhaseStatus, RunState, RunStatus, agent_key,
};
use crate::store::{MemoryStore, Store, get_typed, put_typed};
use crate::swarm::{PhaseDispatch, SwarmScheduler};

const RUNS_NAMESPACE: &str = "runs";

/// Caller-supplied data for a new run.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    pub project_id: String,
    /// Seed artifacts visible to every phase
    pub inputs: BTreeMap<String, Value>,
    pub labels: BTreeMap<String, String>,
}

impl RunMetadata {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, name: &str, value: Value) -> Self {
        self.inputs.insert(name.to_string(), value);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Result of a successful `run_phase`.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase: String,
    pub groups: Vec<Vec<String>>,
    pub outcomes: Vec<Outcome>,
    pub governance: GovernanceResult,
    pub pre_checkpoint: String,
    pub post_checkpoint: String,
    /// `None` once the last phase has completed
    pub next_phase: Option<String>,
    /// Optional phases passed over to reach `phase`
    pub skipped_phases: Vec<String>,
    #[serde(skip)]
    pub duration: Duration,
}

#[derive(Clone)]
struct ActiveRun {
    manager: Arc<PhaseManager>,
    state: RunState,
}

/// Builder for [`WorkflowEngine`].
pub struct EngineBuilder {
    executor: Arc<dyn AgentExecutor>,
    store: Option<Arc<dyn Store>>,
    governance: Option<Arc<dyn GovernanceEvaluator>>,
    budget: Option<Arc<BudgetEnforcer>>,
    config: MaestroToml,
    event_tx: Option<EventSender>,
}

impl EngineBuilder {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            executor,
            store: None,
            governance: None,
            budget: None,
            config: MaestroToml::default(),
            event_tx: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_governance(mut self, governance: Arc<dyn GovernanceEvaluator>) -> Self {
        self.governance = Some(governance);
        self
    }

    /// Use a prepared enforcer instead of one built from `[budget]` config.
    pub fn with_budget(mut self, budget: Arc<BudgetEnforcer>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_config(mut self, config: MaestroToml) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Assemble the engine and load the persisted budget ledger.
    pub async fn build(self) -> Result<WorkflowEngine, EngineError> {
        let store: Arc<dyn Store> = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let budget = match self.budget {
            Some(budget) => budget,
            None => Arc::new(
                BudgetEnforcer::new(self.config.budget.scopes.clone()).with_store(store.clone()),
            ),
        };
        budget.load().await?;

        let mut swarm = SwarmScheduler::new(self.executor)
            .with_retry(RetryExecutor::new(self.config.retry.to_retry_config()))
            .with_budget(budget.clone())
            .with_config(self.config.swarm_config());
        if let Some(tx) = &self.event_tx {
            swarm = swarm.with_event_channel(tx.clone());
        }

        Ok(WorkflowEngine {
            swarm,
            checkpoints: CheckpointManager::new(store.clone()),
            budget,
            governance: self.governance.unwrap_or_else(|| Arc::new(AlwaysPass)),
            store,
            config: self.config,
            event_tx: self.event_tx,
            run: RwLock::new(None),
            phase_lock: Arc::new(Mutex::new(())),
            cancel: std::sync::Mutex::new(None),
        })
    }
}

/// Drives one run through its workflow.
pub struct WorkflowEngine {
    swarm: SwarmScheduler,
    checkpoints: CheckpointManager,
    budget: Arc<BudgetEnforcer>,
    governance: Arc<dyn GovernanceEvaluator>,
    store: Arc<dyn Store>,
    config: MaestroToml,
    event_tx: Option<EventSender>,
    run: RwLock<Option<ActiveRun>>,
    /// Held by every state-mutating call; contention means `RunBusy`
    phase_lock: Arc<Mutex<()>>,
    /// Token of the phase currently in flight
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

/// A phase whose swarm is executing.
///
/// Dropped before `finish`, which happens when the caller abandons
/// `run_phase`, it cancels the swarm and records the phase as failed. The
/// phase lock is held until that record is persisted.
struct PhaseInFlight<'a> {
    engine: &'a WorkflowEngine,
    phase: String,
    /// State committed at dispatch
    dispatched: Option<RunState>,
    lock: Option<OwnedMutexGuard<()>>,
    timer: Option<JoinHandle<()>>,
    cancel_on_drop: Option<DropGuard>,
}

impl PhaseInFlight<'_> {
    /// The swarm returned; hand the phase lock back to the caller.
    fn finish(mut self) -> Option<OwnedMutexGuard<()>> {
        self.dispatched = None;
        if let Some(guard) = self.cancel_on_drop.take() {
            guard.disarm();
        }
        self.lock.take()
    }
}

impl Drop for PhaseInFlight<'_> {
    fn drop(&mut self) {
        self.engine.cancel_slot().take();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let Some(mut state) = self.dispatched.take() else {
            return;
        };

        let err = EngineError::Cancelled {
            phase: self.phase.clone(),
        };
        for agent in state
            .agent_states
            .values_mut()
            .filter(|a| a.phase == self.phase && !a.status.is_terminal())
        {
            if let Err(e) = agent.fail("phase abandoned before completion") {
                warn!(agent = %agent.agent_id, error = %e, "agent state not updated");
            }
        }
        state.set_phase_status(&self.phase, PhaseStatus::Failed);
        state.status = RunStatus::NeedsRevision;
        state.last_error = Some(err.to_string());
        state.touch();
        warn!(phase = %self.phase, "run_phase dropped mid-flight; phase cancelled");

        if let Ok(mut run) = self.engine.run.try_write()
            && let Some(active) = run.as_mut()
        {
            active.state = state.clone();
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(phase = %self.phase, "no runtime to persist abandoned phase");
            return;
        };
        let store = self.engine.store.clone();
        let event_tx = self.engine.event_tx.clone();
        let lock = self.lock.take();
        let phase = self.phase.clone();
        handle.spawn(async move {
            let _lock = lock;
            if let Err(e) = put_typed(store.as_ref(), RUNS_NAMESPACE, &state.run_id, &state).await {
                error!(phase = %phase, error = %e, "failed to record abandoned phase");
                return;
            }
            emit(
                event_tx.as_ref(),
                EngineEvent::PhaseFailed {
                    run_id: state.run_id.clone(),
                    phase,
                    error: err.to_string(),
                },
            )
            .await;
        });
    }
}

impl WorkflowEngine {
    pub fn builder(executor: Arc<dyn AgentExecutor>) -> EngineBuilder {
        EngineBuilder::new(executor)
    }

    /// Create a run positioned at the first phase and write its initial PRE checkpoint.
    #[instrument(skip_all, fields(workflow = %definition.name, project = %metadata.project_id))]
    pub async fn start_run(
        &self,
        definition: WorkflowDefinition,
        metadata: RunMetadata,
    ) -> Result<RunState, EngineError> {
        let _guard = self.try_lock_phase().await?;
        let manager = Arc::new(PhaseManager::new(definition)?);

        let run_id = Uuid::new_v4().to_string();
        let workflow = manager.workflow();
        let mut state = RunState::new(
            &run_id,
            &metadata.project_id,
            &workflow.name,
            &workflow.phase_names(),
            &manager.first().name,
        );
        state.labels = metadata.labels;
        state.artifacts = metadata
            .inputs
            .into_iter()
            .map(|(name, value)| (name, Artifact::input(value)))
            .collect();

        let first = manager.first().name.clone();
        let checkpoint = self
            .checkpoints
            .save_checkpoint(&mut state, &first, CheckpointKind::Pre, None)
            .await?;

        self.persist(&state).await?;
        self.swarm.cache().clear();
        *self.run.write().await = Some(ActiveRun {
            manager,
            state: state.clone(),
        });

        info!(run_id = %run_id, first_phase = %first, "run started");
        self.emit(EngineEvent::RunStarted {
            run_id: run_id.clone(),
            workflow: state.workflow.clone(),
        })
        .await;
        self.emit_checkpoint(&checkpoint).await;
        Ok(state)
    }

    /// Reload a persisted run and make it the active one.
    #[instrument(skip(self, definition))]
    pub async fn resume(
        &self,
        definition: WorkflowDefinition,
        run_id: &str,
    ) -> Result<RunState, EngineError> {
        let _guard = self.try_lock_phase().await?;
        let manager = Arc::new(PhaseManager::new(definition)?);

        let state: RunState = get_typed(self.store.as_ref(), RUNS_NAMESPACE, run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if manager.workflow().phase(&state.current_phase).is_none() {
            return Err(WorkflowError::UnknownCurrentPhase(state.current_phase.clone()).into());
        }

        self.swarm.cache().clear();
        *self.run.write().await = Some(ActiveRun {
            manager,
            state: state.clone(),
        });
        info!(status = %state.status, current_phase = %state.current_phase, "run resumed");
        Ok(state)
    }

    /// Execute one phase: `phase`, or the current phase when `None`.
    ///
    /// Naming a phase ahead of the current one skips the phases in between,
    /// which must all be optional. Failures leave the run resumable: the
    /// phase is marked failed and the same phase can be run again.
    #[instrument(skip(self))]
    pub async fn run_phase(&self, phase: Option<&str>) -> Result<PhaseOutcome, EngineError> {
        let lock = self.try_lock_phase().await?;
        let started = Instant::now();
        let ActiveRun { manager, mut state } = self.active().await?;

        if state.status.is_terminal() {
            return Err(EngineError::RunFinished {
                run_id: state.run_id.clone(),
                status: state.status.to_string(),
            });
        }

        let target = phase.unwrap_or(&state.current_phase).to_string();
        let definition = manager.resolve(&target)?.clone();
        let current = manager.current(&state)?.clone();

        let skipped_phases: Vec<String> = if definition.order > current.order {
            manager
                .skippable_between(&current.name, &target)?
                .into_iter()
                .map(|p| p.name.clone())
                .collect()
        } else if definition.order < current.order {
            return Err(TransitionRejected::NotForward {
                from: current.name.clone(),
                to: target,
                from_order: current.order,
                to_order: definition.order,
            }
            .into());
        } else {
            Vec::new()
        };

        let missing: Vec<String> = definition
            .required_inputs
            .iter()
            .filter(|name| !state.artifacts.contains_key(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let err = EngineError::MissingInputs {
                phase: target.clone(),
                missing,
            };
            state.last_error = Some(err.to_string());
            self.commit(&state).await?;
            return Err(err);
        }

        for name in &skipped_phases {
            state.set_phase_status(name, PhaseStatus::Skipped);
            info!(phase = %name, "optional phase skipped");
            self.emit(EngineEvent::PhaseSkipped {
                run_id: state.run_id.clone(),
                phase: name.clone(),
            })
            .await;
        }
        state.current_phase = target.clone();

        let pre_checkpoint = self.pre_checkpoint(&mut state, &target).await?;

        state.status = RunStatus::Running;
        state.last_error = None;
        state.set_phase_status(&target, PhaseStatus::Running);
        for agent in &definition.responsible_agents {
            state
                .agent_states
                .insert(agent_key(&target, agent), AgentState::new(agent, &target));
        }
        self.commit(&state).await?;
        self.emit(EngineEvent::PhaseStarted {
            run_id: state.run_id.clone(),
            phase: target.clone(),
        })
        .await;

        let settings = self.config.phase_settings(&definition);
        let scope = ScopeContext::new(&state.project_id);
        let dispatch = PhaseDispatch::new(&state.run_id, &state.project_id, definition.clone())
            .with_artifacts(
                state
                    .artifacts
                    .iter()
                    .map(|(name, a)| (name.clone(), a.value.clone()))
                    .collect(),
            )
            .with_estimated_units(settings.estimated_units)
            .with_max_workers(settings.max_workers)
            .with_scope(scope.clone());

        let cancel = CancellationToken::new();
        *self.cancel_slot() = Some(cancel.clone());
        let timer = settings.timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(?timeout, "phase timed out; cancelling");
                cancel.cancel();
            })
        });
        let in_flight = PhaseInFlight {
            engine: self,
            phase: target.clone(),
            dispatched: Some(state.clone()),
            lock: Some(lock),
            timer,
            cancel_on_drop: Some(cancel.clone().drop_guard()),
        };

        let result = self.swarm.execute(dispatch, &cancel).await;
        let _lock = in_flight.finish();

        let report = match result {
            Ok(report) => report,
            Err(SwarmError::DependencyCycle { nodes }) => {
                let err = EngineError::DependencyCycle {
                    phase: target.clone(),
                    nodes,
                };
                return Err(self.fail_phase(state, &target, err).await);
            }
            Err(err) => return Err(self.fail_phase(state, &target, EngineError::Swarm(err)).await),
        };

        for outcome in &report.outcomes {
            apply_outcome(&mut state, &target, outcome);
        }
        state
            .budget_counters
            .extend(self.budget.counters(&scope).await);

        if report.cancelled {
            let err = EngineError::Cancelled {
                phase: target.clone(),
            };
            return Err(self.fail_phase(state, &target, err).await);
        }

        if let Some(first_failure) = report.failed().next() {
            let err = match &first_failure.exit_status {
                ExitStatus::BudgetRejected(exceeded) => EngineError::BudgetExceeded {
                    phase: target.clone(),
                    agent: first_failure.agent_id.clone(),
                    source: exceeded.clone(),
                },
                _ => EngineError::PhaseFailed {
                    phase: target.clone(),
                    failed_agents: report.failed().map(|o| o.agent_id.clone()).collect(),
                    first_error: first_failure.first_error(),
                },
            };
            return Err(self.fail_phase(state, &target, err).await);
        }

        state.status = RunStatus::AwaitingGovernance;
        self.commit(&state).await?;

        let governance = match self.governance.evaluate(&state, &definition).await {
            Ok(result) => result,
            Err(source) => {
                let err = EngineError::GovernanceUnavailable {
                    phase: target.clone(),
                    source,
                };
                return Err(self.fail_phase(state, &target, err).await);
            }
        };
        state.governance.insert(target.clone(), governance.clone());
        self.emit(EngineEvent::GovernanceEvaluated {
            run_id: state.run_id.clone(),
            phase: target.clone(),
            passed: governance.passed,
            blocked_gate_ids: governance.blocked_gate_ids.clone(),
        })
        .await;

        if !governance.passed {
            let err = EngineError::Governance {
                phase: target.clone(),
                blocked_gates: governance.blocked_gate_ids.clone(),
            };
            return Err(self.fail_phase(state, &target, err).await);
        }

        state.set_phase_status(&target, PhaseStatus::Completed);
        state.completed_phases.push(target.clone());
        let next_phase = manager.next_after(&target).map(|p| p.name.clone());
        match &next_phase {
            Some(next) => {
                manager.validate_transition(&target, next, &state.completed_phases)?;
                state.current_phase = next.clone();
                state.status = RunStatus::Running;
            }
            None => state.status = RunStatus::Completed,
        }

        let post = self
            .checkpoints
            .save_checkpoint(&mut state, &target, CheckpointKind::Post, Some(governance.clone()))
            .await?;
        self.commit(&state).await?;
        self.emit_checkpoint(&post).await;

        info!(
            phase = %target,
            next = ?next_phase,
            agents = report.outcomes.len(),
            "phase completed"
        );
        self.emit(EngineEvent::PhaseCompleted {
            run_id: state.run_id.clone(),
            phase: target.clone(),
            next_phase: next_phase.clone(),
        })
        .await;
        if next_phase.is_none() {
            self.emit(EngineEvent::RunCompleted {
                run_id: state.run_id.clone(),
            })
            .await;
        }

        Ok(PhaseOutcome {
            phase: target,
            groups: report.groups,
            outcomes: report.outcomes,
            governance,
            pre_checkpoint,
            post_checkpoint: post.id,
            next_phase,
            skipped_phases,
            duration: started.elapsed(),
        })
    }

    /// Run the current phase; returns the new current phase, or `None` once
    /// the run is complete.
    pub async fn advance_phase(&self) -> Result<Option<String>, EngineError> {
        Ok(self.run_phase(None).await?.next_phase)
    }

    /// Cancel the phase in flight, if any. Returns whether one was running.
    pub async fn cancel_phase(&self) -> bool {
        match self.cancel_slot().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn get_status(&self) -> Result<RunState, EngineError> {
        Ok(self.active().await?.state)
    }

    /// Move the run to `Aborted`. Terminal.
    pub async fn abort(&self, reason: &str) -> Result<RunState, EngineError> {
        let _guard = self.try_lock_phase().await?;
        let mut state = self.active().await?.state;
        if state.status.is_terminal() {
            return Err(EngineError::RunFinished {
                run_id: state.run_id.clone(),
                status: state.status.to_string(),
            });
        }
        state.status = RunStatus::Aborted;
        state.last_error = Some(reason.to_string());
        self.commit(&state).await?;

        warn!(run_id = %state.run_id, reason, "run aborted");
        self.emit(EngineEvent::RunAborted {
            run_id: state.run_id.clone(),
            reason: reason.to_string(),
        })
        .await;
        Ok(state)
    }

    /// Write a manual checkpoint of the current state.
    pub async fn save_checkpoint(&self) -> Result<Checkpoint, EngineError> {
        let _guard = self.try_lock_phase().await?;
        let mut state = self.active().await?.state;
        let phase = state.current_phase.clone();
        let governance = state.governance.get(&phase).cloned();
        let checkpoint = self
            .checkpoints
            .save_checkpoint(&mut state, &phase, CheckpointKind::Manual, governance)
            .await?;
        self.commit(&state).await?;
        self.emit_checkpoint(&checkpoint).await;
        Ok(checkpoint)
    }

    pub async fn load_checkpoint(&self, id: &str) -> Result<Checkpoint, EngineError> {
        let run_id = self.active_run_id().await?;
        Ok(self.checkpoints.load_checkpoint(&run_id, id).await?)
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>, EngineError> {
        let run_id = self.active_run_id().await?;
        Ok(self.checkpoints.list_checkpoints(&run_id).await?)
    }

    pub async fn compare_checkpoints(&self, a: &str, b: &str) -> Result<CheckpointDiff, EngineError> {
        let run_id = self.active_run_id().await?;
        Ok(self.checkpoints.compare(&run_id, a, b).await?)
    }

    /// Restore the run to checkpoint `id`, archiving downstream state.
    #[instrument(skip(self))]
    pub async fn rollback_to_checkpoint(&self, id: &str) -> Result<Checkpoint, EngineError> {
        let _guard = self.try_lock_phase().await?;
        let ActiveRun { manager, mut state } = self.active().await?;
        if state.status == RunStatus::Aborted {
            return Err(EngineError::RunFinished {
                run_id: state.run_id.clone(),
                status: state.status.to_string(),
            });
        }

        let checkpoint = self.checkpoints.rollback(&mut state, &manager, id).await?;
        self.commit(&state).await?;

        self.emit(EngineEvent::RolledBack {
            run_id: state.run_id.clone(),
            target_checkpoint_id: id.to_string(),
            checkpoint_id: checkpoint.id.clone(),
        })
        .await;
        self.emit_checkpoint(&checkpoint).await;
        Ok(checkpoint)
    }

    /// Archive records written by rollbacks of the active run.
    pub async fn archives(&self) -> Result<BTreeMap<String, ArchiveRecord>, EngineError> {
        let run_id = self.active_run_id().await?;
        Ok(self.checkpoints.archives(&run_id).await?)
    }

    /// Ask the governance evaluator about `phase` against the current state.
    /// Nothing is recorded.
    pub async fn evaluate_governance(&self, phase: &str) -> Result<GovernanceResult, EngineError> {
        let ActiveRun { manager, state } = self.active().await?;
        let definition = manager.resolve(phase)?;
        self.governance
            .evaluate(&state, definition)
            .await
            .map_err(|source| EngineError::GovernanceUnavailable {
                phase: phase.to_string(),
                source,
            })
    }

    /// Budget usage and headroom for the active run's project.
    pub async fn check_budget(&self) -> Result<BudgetReport, EngineError> {
        let state = self.active().await?.state;
        Ok(self
            .budget
            .report(&ScopeContext::new(&state.project_id))
            .await)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.swarm.cache().stats()
    }

    /// Definition of the phase the run is positioned at.
    pub async fn current_phase(&self) -> Result<PhaseDefinition, EngineError> {
        let ActiveRun { manager, state } = self.active().await?;
        Ok(manager.current(&state)?.clone())
    }

    async fn active(&self) -> Result<ActiveRun, EngineError> {
        self.run
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(EngineError::NoActiveRun)
    }

    async fn active_run_id(&self) -> Result<String, EngineError> {
        self.run
            .read()
            .await
            .as_ref()
            .map(|active| active.state.run_id.clone())
            .ok_or(EngineError::NoActiveRun)
    }

    fn cancel_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn try_lock_phase(&self) -> Result<OwnedMutexGuard<()>, EngineError> {
        match self.phase_lock.clone().try_lock_owned() {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let run_id = self.active_run_id().await.unwrap_or_default();
                debug!(run_id = %run_id, "rejecting call; phase in flight");
                Err(EngineError::RunBusy { run_id })
            }
        }
    }

    /// Reuse the active checkpoint if it is already this phase's PRE.
    async fn pre_checkpoint(
        &self,
        state: &mut RunState,
        phase: &str,
    ) -> Result<String, EngineError> {
        if let Some(active) = &state.active_checkpoint {
            let checkpoint = self.checkpoints.load_checkpoint(&state.run_id, active).await?;
            if checkpoint.kind == CheckpointKind::Pre && checkpoint.phase == phase {
                debug!(checkpoint = %checkpoint.id, "reusing PRE checkpoint");
                return Ok(checkpoint.id);
            }
        }
        let checkpoint = self
            .checkpoints
            .save_checkpoint(state, phase, CheckpointKind::Pre, None)
            .await?;
        self.emit_checkpoint(&checkpoint).await;
        Ok(checkpoint.id)
    }

    /// Record a phase failure on the run and hand the error back.
    async fn fail_phase(&self, mut state: RunState, phase: &str, err: EngineError) -> EngineError {
        state.set_phase_status(phase, PhaseStatus::Failed);
        state.status = RunStatus::NeedsRevision;
        state.last_error = Some(err.to_string());

        warn!(phase, error = %err, "phase failed");
        if let Err(commit_err) = self.commit(&state).await {
            error!(phase, error = %commit_err, "failed to record phase failure");
            return commit_err;
        }
        self.emit(EngineEvent::PhaseFailed {
            run_id: state.run_id.clone(),
            phase: phase.to_string(),
            error: err.to_string(),
        })
        .await;
        err
    }

    /// Persist `state` and publish it as the active run's state.
    async fn commit(&self, state: &RunState) -> Result<(), EngineError> {
        let mut state = state.clone();
        state.touch();
        self.persist(&state).await?;
        if let Some(active) = self.run.write().await.as_mut() {
            active.state = state;
        }
        Ok(())
    }

    async fn persist(&self, state: &RunState) -> Result<(), EngineError> {
        put_typed(self.store.as_ref(), RUNS_NAMESPACE, &state.run_id, state).await?;
        Ok(())
    }

    async fn emit(&self, event: EngineEvent) {
        emit(self.event_tx.as_ref(), event).await;
    }

    async fn emit_checkpoint(&self, checkpoint: &Checkpoint) {
        self.emit(EngineEvent::CheckpointSaved {
            run_id: checkpoint.run_id.clone(),
            checkpoint_id: checkpoint.id.clone(),
            kind: checkpoint.kind,
        })
        .await;
    }
}

/// Load a persisted run without activating it.
pub async fn load_run(store: &dyn Store, run_id: &str) -> Result<RunState, EngineError> {
    get_typed(store, RUNS_NAMESPACE, run_id)
        .await?
        .ok_or_else(|| EngineError::RunNotFound {
            run_id: run_id.to_string(),
        })
}

/// Ids of every persisted run.
pub async fn list_runs(store: &dyn Store) -> Result<Vec<String>, EngineError> {
    Ok(store.list(RUNS_NAMESPACE).await?)
}

/// Fold one agent outcome into the run.
fn apply_outcome(state: &mut RunState, phase: &str, outcome: &Outcome) {
    let agent_state = state
        .agent_states
        .entry(agent_key(phase, &outcome.agent_id))
        .or_insert_with(|| AgentState::new(&outcome.agent_id, phase));

    agent_state.token_usage = outcome.token_usage;
    agent_state.model_used = outcome.model_used.clone();
    agent_state.started_at = outcome.started_at;
    agent_state.completed_at = outcome.completed_at;
    let transition = if outcome.success {
        agent_state.complete()
    } else {
        agent_state.fail(outcome.first_error())
    };
    if let Err(err) = transition {
        warn!(agent = %outcome.agent_id, error = %err, "agent state not updated");
    }

    state.token_usage.add(outcome.token_usage);
    if outcome.success {
        for (name, value) in &outcome.artifacts {
            state.artifacts.insert(
                name.clone(),
                Artifact::produced(phase, &outcome.agent_id, value.clone()),
            );
        }
    }
}
