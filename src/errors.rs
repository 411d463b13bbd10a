//! Typed error hierarchy for the maestro engine.
//!
//! One enum per subsystem, plus the structured budget violation:
//! - `EngineError` — surfaced by the workflow engine to its callers
//! - `SwarmError` — scheduling and infrastructure failures inside a swarm
//! - `CheckpointError` — checkpoint persistence and lookup
//! - `RetryError` — terminal result of a retried call
//! - `AgentError` — raised by agent executors
//! - `StoreError` — persistent store I/O
//! - `WorkflowError` / `TransitionRejected` — definition and transition validation

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by an agent executor.
///
/// `Transient` is the designated retryable type; `Fatal` is never retried.
/// `Other` is classified by message signature (see `retry::classify_message`).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transient agent failure: {0}")]
    Transient(String),

    #[error("agent failure: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Terminal failure of a call wrapped by the retry executor.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The error was not retryable; returned on the attempt that raised it.
    #[error("non-retryable failure: {0}")]
    Fatal(E),

    /// Every attempt failed with a retryable error.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    /// The underlying error of the last attempt.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Admission rejected by the budget enforcer.
///
/// `scope` is the most relevant violation (largest overshoot); any other
/// scopes that would also have been exceeded are listed in `also_exceeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error(
    "budget scope '{scope}' exceeded: limit {limit}, current usage {current}, requested {requested}"
)]
pub struct BudgetExceeded {
    pub scope: String,
    pub limit: u64,
    pub current: u64,
    pub requested: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_exceeded: Vec<String>,
}

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize record {namespace}/{key}: {source}")]
    Serialization {
        namespace: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

/// Errors from the checkpoint manager.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {id} not found for run {run_id}")]
    NotFound { run_id: String, id: String },

    #[error("checkpoint {id} already exists; checkpoints are immutable")]
    AlreadyExists { id: String },

    #[error("rollback target {id} references phase '{phase}' which is not in the workflow")]
    UnknownPhase { id: String, phase: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the swarm scheduler. Individual agent failures are never
/// reported here; they become failed outcomes.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("dependency cycle detected; unresolved agents: {nodes:?}")]
    DependencyCycle { nodes: Vec<String> },

    #[error("agent '{0}' listed more than once")]
    DuplicateAgent(String),

    #[error("task for agent '{agent}' panicked: {message}")]
    TaskPanicked { agent: String, message: String },

    #[error("worker pool closed while scheduling agent '{0}'")]
    PoolClosed(String),

    #[error("failed to record budget usage for agent '{agent}': {source}")]
    BudgetLedger {
        agent: String,
        #[source]
        source: StoreError,
    },
}

/// Errors from validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("workflow '{0}' has no phases")]
    Empty(String),

    #[error("duplicate phase name: {0}")]
    DuplicateName(String),

    #[error("phase '{phase}' reuses order {order} already taken by '{other}'")]
    DuplicateOrder {
        phase: String,
        other: String,
        order: u32,
    },

    #[error("current phase '{0}' is not part of the workflow")]
    UnknownCurrentPhase(String),
}

/// Why a phase transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionRejected {
    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("phase '{from}' has not been completed")]
    NotCompleted { from: String },

    #[error("transition {from} (order {from_order}) -> {to} (order {to_order}) is not forward")]
    NotForward {
        from: String,
        to: String,
        from_order: u32,
        to_order: u32,
    },

    #[error("cannot skip non-optional phase '{0}'")]
    NotOptional(String),
}

/// Errors surfaced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active run; call start_run or resume first")]
    NoActiveRun,

    #[error("run {run_id} already has a phase in flight")]
    RunBusy { run_id: String },

    #[error("run {run_id} is finished ({status})")]
    RunFinished { run_id: String, status: String },

    #[error("run {run_id} not found in store")]
    RunNotFound { run_id: String },

    #[error("phase '{phase}' failed: agents {failed_agents:?} did not succeed ({first_error})")]
    PhaseFailed {
        phase: String,
        failed_agents: Vec<String>,
        first_error: String,
    },

    #[error("phase '{phase}' blocked by governance gates {blocked_gates:?}")]
    Governance {
        phase: String,
        blocked_gates: Vec<String>,
    },

    #[error("governance evaluation for phase '{phase}' failed: {source}")]
    GovernanceUnavailable {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("agent '{agent}' rejected by budget in phase '{phase}': {source}")]
    BudgetExceeded {
        phase: String,
        agent: String,
        #[source]
        source: BudgetExceeded,
    },

    #[error("phase '{phase}' has a dependency cycle among {nodes:?}")]
    DependencyCycle { phase: String, nodes: Vec<String> },

    #[error("phase '{phase}' was cancelled")]
    Cancelled { phase: String },

    #[error("phase '{phase}' is missing required inputs {missing:?}")]
    MissingInputs { phase: String, missing: Vec<String> },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionRejected),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Swarm(SwarmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether the run stays resumable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::PhaseFailed { .. }
                | EngineError::Governance { .. }
                | EngineError::GovernanceUnavailable { .. }
                | EngineError::BudgetExceeded { .. }
                | EngineError::Cancelled { .. }
                | EngineError::MissingInputs { .. }
                | EngineError::RunBusy { .. }
        )
    }
}
