//! Swarm executor: runs a phase's agents group by group.
//!
//! Groups run strictly one after another. Inside a group every agent is
//! spawned into a `JoinSet` at once and a semaphore of `max_workers` permits
//! bounds how many execute concurrently; dropping `execute` aborts them. Each
//! agent call is admitted by the budget enforcer, wrapped by the retry
//! executor, and turned into an `Outcome`; agent failures never surface as
//! errors from `execute`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentContext, AgentExecutor, ExitStatus, Outcome};
use crate::budget::{BudgetEnforcer, Reservation, ScopeContext};
use crate::cache::{CacheKey, ContextCache};
use crate::errors::{RetryError, SwarmError};
use crate::events::{EngineEvent, EventSender, SwarmEvent, emit};
use crate::phase::PhaseDefinition;
use crate::retry::RetryExecutor;
use crate::swarm::scheduler::compute_groups;

/// Inputs shared by every agent in a swarm, keyed by content.
pub type InputCache = ContextCache<Arc<BTreeMap<String, Value>>>;

/// Configuration for the swarm executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Maximum agents executing at once within a group
    pub max_workers: usize,
    /// Skip later groups once an agent in a group has failed
    pub fail_fast: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            fail_fast: true,
        }
    }
}

impl SwarmConfig {
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// One phase's worth of work for the swarm.
#[derive(Debug, Clone)]
pub struct PhaseDispatch {
    pub run_id: String,
    pub project_id: String,
    pub phase: Arc<PhaseDefinition>,
    /// Run artifacts visible to every agent
    pub artifacts: Arc<BTreeMap<String, Value>>,
    /// Units reserved per agent before it is called
    pub estimated_units: u64,
    /// Overrides `SwarmConfig::max_workers` for this dispatch
    pub max_workers: Option<usize>,
    pub scope: ScopeContext,
}

impl PhaseDispatch {
    pub fn new(run_id: &str, project_id: &str, phase: PhaseDefinition) -> Self {
        Self {
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
            phase: Arc::new(phase),
            artifacts: Arc::new(BTreeMap::new()),
            estimated_units: 0,
            max_workers: None,
            scope: ScopeContext::new(project_id),
        }
    }

    pub fn with_artifacts(mut self, artifacts: BTreeMap<String, Value>) -> Self {
        self.artifacts = Arc::new(artifacts);
        self
    }

    pub fn with_estimated_units(mut self, units: u64) -> Self {
        self.estimated_units = units;
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    pub fn with_scope(mut self, scope: ScopeContext) -> Self {
        self.scope = scope;
        self
    }
}

/// Result of running a phase's swarm.
#[derive(Debug, Clone)]
pub struct SwarmReport {
    /// Execution groups, in the order they ran
    pub groups: Vec<Vec<String>>,
    /// One outcome per agent, in the phase's `responsible_agents` order
    pub outcomes: Vec<Outcome>,
    /// The cancellation token fired before every agent finished
    pub cancelled: bool,
    pub duration: Duration,
}

impl SwarmReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Everything a spawned agent task needs, shared across the dispatch.
struct DispatchShared {
    executor: Arc<dyn AgentExecutor>,
    retry: RetryExecutor,
    cache: Arc<InputCache>,
    budget: Arc<BudgetEnforcer>,
    dispatch: PhaseDispatch,
    base_digest: CacheKey,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    event_tx: Option<EventSender>,
}

impl DispatchShared {
    async fn emit(&self, event: SwarmEvent) {
        emit(self.event_tx.as_ref(), EngineEvent::Swarm(event)).await;
    }
}

/// Dependency-aware parallel executor for one phase at a time.
#[derive(Clone)]
pub struct SwarmScheduler {
    executor: Arc<dyn AgentExecutor>,
    retry: RetryExecutor,
    cache: Arc<InputCache>,
    budget: Arc<BudgetEnforcer>,
    config: SwarmConfig,
    event_tx: Option<EventSender>,
}

impl SwarmScheduler {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            executor,
            retry: RetryExecutor::default(),
            cache: Arc::new(InputCache::new()),
            budget: Arc::new(BudgetEnforcer::unlimited()),
            config: SwarmConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_budget(mut self, budget: Arc<BudgetEnforcer>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<InputCache> {
        &self.cache
    }

    /// Execution groups for a phase without running anything.
    pub fn plan(&self, phase: &PhaseDefinition) -> Result<Vec<Vec<String>>, SwarmError> {
        compute_groups(&phase.responsible_agents, &phase.dependency_map)
    }

    /// Run every responsible agent of `dispatch.phase`.
    ///
    /// Fails only on scheduling or infrastructure problems: a dependency
    /// cycle (before anything runs), a panicked task, or a budget ledger
    /// that cannot be written.
    #[instrument(skip_all, fields(run_id = %dispatch.run_id, phase = %dispatch.phase.name))]
    pub async fn execute(
        &self,
        dispatch: PhaseDispatch,
        cancel: &CancellationToken,
    ) -> Result<SwarmReport, SwarmError> {
        let started = Instant::now();
        let phase = dispatch.phase.clone();
        let groups = self.plan(&phase)?;

        if groups.is_empty() {
            return Ok(SwarmReport {
                groups,
                outcomes: Vec::new(),
                cancelled: false,
                duration: started.elapsed(),
            });
        }

        let max_workers = dispatch.max_workers.unwrap_or(self.config.max_workers).max(1);
        info!(
            agents = phase.responsible_agents.len(),
            groups = groups.len(),
            max_workers,
            "dispatching swarm"
        );

        let shared = Arc::new(DispatchShared {
            executor: self.executor.clone(),
            retry: self.retry.clone(),
            cache: self.cache.clone(),
            budget: self.budget.clone(),
            base_digest: CacheKey::from_json(&json!(dispatch.artifacts.as_ref())),
            dispatch,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            cancel: cancel.clone(),
            event_tx: self.event_tx.clone(),
        });

        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut failed = false;

        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() || (failed && self.config.fail_fast) {
                break;
            }

            debug!(group = index, agents = ?group, "starting group");
            shared
                .emit(SwarmEvent::GroupStarted {
                    phase: phase.name.clone(),
                    group: index,
                    agents: group.clone(),
                })
                .await;

            let results = if let [agent] = group.as_slice() {
                let upstream = upstream_artifacts(&phase, agent, &outcomes);
                vec![dispatch_agent(shared.clone(), agent.clone(), index, upstream).await]
            } else {
                let mut tasks = JoinSet::new();
                let mut names: HashMap<task::Id, String> = HashMap::new();
                for agent in group {
                    let upstream = upstream_artifacts(&phase, agent, &outcomes);
                    let handle = tasks.spawn(dispatch_agent(
                        shared.clone(),
                        agent.clone(),
                        index,
                        upstream,
                    ));
                    names.insert(handle.id(), agent.clone());
                }
                let mut results = Vec::with_capacity(group.len());
                while let Some(joined) = tasks.join_next().await {
                    results.push(joined.unwrap_or_else(|e| {
                        Err(SwarmError::TaskPanicked {
                            agent: names.remove(&e.id()).unwrap_or_default(),
                            message: e.to_string(),
                        })
                    }));
                }
                results
            };

            let mut group_failed = 0;
            for result in results {
                let outcome = result?;
                if !outcome.success {
                    group_failed += 1;
                }
                outcomes.insert(outcome.agent_id.clone(), outcome);
            }

            shared
                .emit(SwarmEvent::GroupCompleted {
                    phase: phase.name.clone(),
                    group: index,
                    succeeded: group.len() - group_failed,
                    failed: group_failed,
                })
                .await;
            failed |= group_failed > 0;
        }

        let cancelled = cancel.is_cancelled();
        let outcomes: Vec<Outcome> = phase
            .responsible_agents
            .iter()
            .map(|agent| {
                outcomes.remove(agent).unwrap_or_else(|| {
                    if cancelled {
                        Outcome::failure(agent, ExitStatus::Cancelled, "phase cancelled")
                    } else {
                        Outcome::failure(agent, ExitStatus::Skipped, "skipped after earlier failure")
                    }
                })
            })
            .collect();

        if cancelled {
            warn!("swarm cancelled before completion");
        }

        Ok(SwarmReport {
            groups,
            outcomes,
            cancelled,
            duration: started.elapsed(),
        })
    }
}

/// Releases a reservation whose agent task was aborted before settling it.
struct HeldReservation {
    budget: Arc<BudgetEnforcer>,
    reservation: Option<Reservation>,
}

impl HeldReservation {
    fn new(budget: Arc<BudgetEnforcer>, reservation: &Reservation) -> Self {
        Self {
            budget,
            reservation: Some(reservation.clone()),
        }
    }

    fn disarm(mut self) {
        self.reservation = None;
    }
}

impl Drop for HeldReservation {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let budget = self.budget.clone();
            handle.spawn(async move { budget.release(&reservation).await });
        }
    }
}

/// Artifacts produced by `agent`'s successful in-phase dependencies.
fn upstream_artifacts(
    phase: &PhaseDefinition,
    agent: &str,
    outcomes: &HashMap<String, Outcome>,
) -> BTreeMap<String, Value> {
    let mut upstream = BTreeMap::new();
    let Some(deps) = phase.dependency_map.get(agent) else {
        return upstream;
    };
    let mut deps: Vec<&String> = deps.iter().collect();
    deps.sort();
    deps.dedup();
    for dep in deps {
        if let Some(outcome) = outcomes.get(dep.as_str()).filter(|o| o.success) {
            for (name, value) in &outcome.artifacts {
                upstream.insert(name.clone(), value.clone());
            }
        }
    }
    upstream
}

async fn dispatch_agent(
    shared: Arc<DispatchShared>,
    agent_id: String,
    group: usize,
    upstream: BTreeMap<String, Value>,
) -> Result<Outcome, SwarmError> {
    let phase = &shared.dispatch.phase;
    let started_at = Utc::now();
    let clock = Instant::now();

    let _permit = tokio::select! {
        _ = shared.cancel.cancelled() => {
            return Ok(finish(
                Outcome::failure(&agent_id, ExitStatus::Cancelled, "cancelled before start"),
                started_at,
                clock,
            ));
        }
        permit = shared.semaphore.clone().acquire_owned() => {
            permit.map_err(|_| SwarmError::PoolClosed(agent_id.clone()))?
        }
    };

    shared
        .emit(SwarmEvent::AgentStarted {
            phase: phase.name.clone(),
            group,
            agent: agent_id.clone(),
        })
        .await;

    let context = build_context(&shared, &agent_id, upstream).await;

    let outcome = match shared
        .budget
        .check_and_reserve(&shared.dispatch.scope, shared.dispatch.estimated_units)
        .await
    {
        Err(exceeded) => {
            let message = exceeded.to_string();
            Outcome::failure(&agent_id, ExitStatus::BudgetRejected(exceeded), message)
        }
        Ok(reservation) => {
            let held = HeldReservation::new(shared.budget.clone(), &reservation);
            let call = shared.retry.call_with_stats(|attempt| {
                debug!(agent = %agent_id, attempt, "calling agent");
                shared.executor.execute(&agent_id, phase, &context)
            });

            let result = tokio::select! {
                _ = shared.cancel.cancelled() => None,
                result = call => Some(result),
            };

            match result {
                None => {
                    shared.budget.release(&reservation).await;
                    held.disarm();
                    Outcome::failure(&agent_id, ExitStatus::Cancelled, "cancelled while running")
                }
                Some((Ok(mut outcome), stats)) => {
                    shared
                        .budget
                        .settle(&reservation, outcome.token_usage)
                        .await
                        .map_err(|source| SwarmError::BudgetLedger {
                            agent: agent_id.clone(),
                            source,
                        })?;
                    held.disarm();
                    outcome.agent_id = agent_id.clone();
                    outcome.attempts = stats.attempts;
                    if !outcome.success && outcome.exit_status == ExitStatus::Success {
                        outcome.exit_status = ExitStatus::Failed;
                    }
                    outcome
                }
                Some((Err(err), stats)) => {
                    shared.budget.release(&reservation).await;
                    held.disarm();
                    let mut outcome = match err {
                        RetryError::Fatal(e) => {
                            Outcome::failure(&agent_id, ExitStatus::Fatal, e.to_string())
                        }
                        RetryError::Exhausted {
                            attempts,
                            last_error,
                        } => Outcome::failure(
                            &agent_id,
                            ExitStatus::RetryExhausted { attempts },
                            last_error.to_string(),
                        ),
                    };
                    outcome.attempts = stats.attempts;
                    outcome
                }
            }
        }
    };

    let outcome = finish(outcome, started_at, clock);
    debug!(
        agent = %agent_id,
        success = outcome.success,
        attempts = outcome.attempts,
        "agent finished"
    );
    shared
        .emit(SwarmEvent::AgentCompleted {
            phase: phase.name.clone(),
            group,
            agent: agent_id.clone(),
            success: outcome.success,
            exit_status: outcome.exit_status.clone(),
            attempts: outcome.attempts,
        })
        .await;
    Ok(outcome)
}

/// Memoized inputs: run artifacts overlaid with upstream artifacts.
async fn build_context(
    shared: &DispatchShared,
    agent_id: &str,
    upstream: BTreeMap<String, Value>,
) -> AgentContext {
    let dispatch = &shared.dispatch;
    let key = CacheKey::from_json(&json!({
        "run": dispatch.run_id,
        "phase": dispatch.phase.name,
        "base": shared.base_digest.as_str(),
        "upstream": upstream,
    }));

    let inputs = match shared
        .cache
        .get_or_compute(&key, || async {
            let mut inputs = dispatch.artifacts.as_ref().clone();
            inputs.extend(upstream);
            Ok::<_, Infallible>(Arc::new(inputs))
        })
        .await
    {
        Ok(inputs) => inputs,
        Err(never) => match never {},
    };

    AgentContext {
        run_id: dispatch.run_id.clone(),
        project_id: dispatch.project_id.clone(),
        phase: dispatch.phase.name.clone(),
        agent_id: agent_id.to_string(),
        inputs,
    }
}

fn finish(mut outcome: Outcome, started_at: chrono::DateTime<Utc>, clock: Instant) -> Outcome {
    outcome.started_at = Some(started_at);
    outcome.completed_at = Some(Utc::now());
    outcome.duration = clock.elapsed();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{ScopeKind, ScopeLimit};
    use crate::errors::AgentError;
    use crate::retry::RetryConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the inputs each agent saw and echoes its id as an artifact.
    #[derive(Default)]
    struct EchoExecutor {
        seen: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    }

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn execute(
            &self,
            agent_id: &str,
            _phase: &PhaseDefinition,
            context: &AgentContext,
        ) -> Result<Outcome, AgentError> {
            self.seen
                .lock()
                .unwrap()
                .insert(agent_id.to_string(), context.inputs.as_ref().clone());
            if agent_id.starts_with("fail") {
                return Ok(Outcome::failure(agent_id, ExitStatus::Failed, "did not converge"));
            }
            if agent_id.starts_with("fatal") {
                return Err(AgentError::Fatal("invalid request".into()));
            }
            Ok(Outcome::success(agent_id)
                .with_artifact(&format!("{}_out", agent_id), json!(agent_id))
                .with_usage(3, 2))
        }
    }

    fn fast_retry() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::default()
                .with_delays(Duration::from_millis(1), Duration::from_millis(2))
                .with_jitter(false),
        )
    }

    fn dispatch(phase: PhaseDefinition) -> PhaseDispatch {
        PhaseDispatch::new("run-1", "proj", phase)
    }

    #[tokio::test]
    async fn test_upstream_artifacts_flow_to_dependents() {
        let executor = Arc::new(EchoExecutor::default());
        let swarm = SwarmScheduler::new(executor.clone()).with_retry(fast_retry());
        let phase = PhaseDefinition::new("dev", 1, vec!["writer".into(), "reviewer".into()])
            .with_dependency("reviewer", vec!["writer".into()]);

        let mut artifacts = BTreeMap::new();
        artifacts.insert("spec".to_string(), json!("v1"));
        let report = swarm
            .execute(
                dispatch(phase).with_artifacts(artifacts),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.groups.len(), 2);
        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen["writer"].get("spec"), Some(&json!("v1")));
        assert!(seen["writer"].get("writer_out").is_none());
        assert_eq!(seen["reviewer"].get("writer_out"), Some(&json!("writer")));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_later_groups() {
        let swarm = SwarmScheduler::new(Arc::new(EchoExecutor::default())).with_retry(fast_retry());
        let phase = PhaseDefinition::new("dev", 1, vec!["fail-a".into(), "after".into()])
            .with_dependency("after", vec!["fail-a".into()]);

        let report = swarm
            .execute(dispatch(phase), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].exit_status, ExitStatus::Failed);
        assert_eq!(report.outcomes[1].exit_status, ExitStatus::Skipped);
        assert_eq!(report.failed().count(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_becomes_failed_outcome() {
        let swarm = SwarmScheduler::new(Arc::new(EchoExecutor::default())).with_retry(fast_retry());
        let phase = PhaseDefinition::new("dev", 1, vec!["fatal-x".into(), "ok".into()]);

        let report = swarm
            .execute(dispatch(phase), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].exit_status, ExitStatus::Fatal);
        assert_eq!(report.outcomes[0].attempts, 1);
        assert!(report.outcomes[0].first_error().contains("invalid request"));
        assert!(report.outcomes[1].success);
    }

    #[tokio::test]
    async fn test_budget_rejection_is_not_retried() {
        let executor = Arc::new(EchoExecutor::default());
        let budget = Arc::new(BudgetEnforcer::new(vec![ScopeLimit::new(
            ScopeKind::Project,
            5,
        )]));
        let swarm = SwarmScheduler::new(executor.clone())
            .with_retry(fast_retry())
            .with_budget(budget);
        let phase = PhaseDefinition::new("dev", 1, vec!["a".into()]);

        let report = swarm
            .execute(
                dispatch(phase).with_estimated_units(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match &report.outcomes[0].exit_status {
            ExitStatus::BudgetRejected(err) => assert_eq!(err.scope, "project"),
            other => panic!("Expected BudgetRejected, got {:?}", other),
        }
        assert_eq!(report.outcomes[0].attempts, 0);
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settled_usage_is_charged() {
        let budget = Arc::new(BudgetEnforcer::new(vec![ScopeLimit::new(
            ScopeKind::Total,
            1_000,
        )]));
        let swarm = SwarmScheduler::new(Arc::new(EchoExecutor::default()))
            .with_retry(fast_retry())
            .with_budget(budget.clone());
        let phase = PhaseDefinition::new("dev", 1, vec!["a".into(), "b".into()]);

        swarm
            .execute(
                dispatch(phase).with_estimated_units(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let report = budget.report(&ScopeContext::new("proj")).await;
        assert_eq!(report.scopes[0].used, 10);
        assert_eq!(report.scopes[0].reserved, 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_runs_nothing() {
        let executor = Arc::new(EchoExecutor::default());
        let swarm = SwarmScheduler::new(executor.clone());
        let phase = PhaseDefinition::new("dev", 1, vec!["a".into(), "b".into()]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = swarm.execute(dispatch(phase), &cancel).await.unwrap();

        assert!(report.cancelled);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.exit_status == ExitStatus::Cancelled)
        );
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_independent_agents_share_cached_inputs() {
        let swarm = SwarmScheduler::new(Arc::new(EchoExecutor::default()));
        let phase = PhaseDefinition::new("dev", 1, vec!["a".into(), "b".into(), "c".into()]);

        swarm
            .execute(dispatch(phase), &CancellationToken::new())
            .await
            .unwrap();

        let stats = swarm.cache().stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 2);
    }
}
