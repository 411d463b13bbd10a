//! Progress events emitted while a run executes.
//!
//! Events are best-effort: a dropped receiver never fails the run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent::ExitStatus;
use crate::checkpoint::CheckpointKind;

pub type EventSender = mpsc::Sender<EngineEvent>;

/// Events from inside one phase's swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    /// A group of independent agents is about to start.
    GroupStarted {
        phase: String,
        group: usize,
        agents: Vec<String>,
    },
    /// An agent acquired a worker slot.
    AgentStarted {
        phase: String,
        group: usize,
        agent: String,
    },
    /// An agent finished (success or failure).
    AgentCompleted {
        phase: String,
        group: usize,
        agent: String,
        success: bool,
        exit_status: ExitStatus,
        attempts: u32,
    },
    /// Every agent in a group has finished.
    GroupCompleted {
        phase: String,
        group: usize,
        succeeded: usize,
        failed: usize,
    },
}

/// Events at run and phase granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: String,
        workflow: String,
    },
    PhaseStarted {
        run_id: String,
        phase: String,
    },
    PhaseSkipped {
        run_id: String,
        phase: String,
    },
    CheckpointSaved {
        run_id: String,
        checkpoint_id: String,
        kind: CheckpointKind,
    },
    GovernanceEvaluated {
        run_id: String,
        phase: String,
        passed: bool,
        blocked_gate_ids: Vec<String>,
    },
    PhaseCompleted {
        run_id: String,
        phase: String,
        next_phase: Option<String>,
    },
    PhaseFailed {
        run_id: String,
        phase: String,
        error: String,
    },
    RolledBack {
        run_id: String,
        target_checkpoint_id: String,
        checkpoint_id: String,
    },
    RunCompleted {
        run_id: String,
    },
    RunAborted {
        run_id: String,
        reason: String,
    },
    Swarm(SwarmEvent),
}

/// Send `event` if a channel is attached.
pub(crate) async fn emit(tx: Option<&EventSender>, event: EngineEvent) {
    if let Some(tx) = tx {
        tx.send(event).await.ok();
    }
}
