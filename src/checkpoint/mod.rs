//! Append-only checkpoints of run state.
//!
//! A checkpoint is written before (`Pre`) and after (`Post`) every phase, on
//! demand (`Manual`), and whenever the run is rolled back (`Rollback`). Each
//! one points at the checkpoint that was active when it was written, so the
//! history forms a parent chain that rollbacks fork but never truncate.

mod manager;

pub use manager::CheckpointManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::governance::GovernanceResult;
use crate::state::{AgentState, Artifact, PhaseStatus, RunSnapshot, RunStatus};

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Pre,
    Post,
    Rollback,
    Manual,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointKind::Pre => "pre",
            CheckpointKind::Post => "post",
            CheckpointKind::Rollback => "rollback",
            CheckpointKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of a run at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    /// Zero-based creation order within the run
    pub sequence: u64,
    pub phase: String,
    pub kind: CheckpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
    /// Set on rollback checkpoints: the checkpoint the run was restored to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_to: Option<String>,
    pub state: RunSnapshot,
    #[serde(default)]
    pub agent_states: BTreeMap<String, AgentState>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance: Option<GovernanceResult>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            sequence: self.sequence,
            phase: self.phase.clone(),
            kind: self.kind,
            parent_checkpoint_id: self.parent_checkpoint_id.clone(),
            rolled_back_to: self.rolled_back_to.clone(),
            status: self.state.status,
            created_at: self.created_at,
        }
    }
}

/// Listing entry for a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub sequence: u64,
    pub phase: String,
    pub kind: CheckpointKind,
    pub parent_checkpoint_id: Option<String>,
    pub rolled_back_to: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: String,
    pub before: Option<PhaseStatus>,
    pub after: Option<PhaseStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceChange {
    pub before: Option<GovernanceResult>,
    pub after: Option<GovernanceResult>,
}

/// Differences between two checkpoints, `from` → `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    pub from: String,
    pub to: String,
    pub added_artifacts: Vec<String>,
    pub removed_artifacts: Vec<String>,
    pub modified_artifacts: Vec<String>,
    pub phase_changes: Vec<PhaseChange>,
    pub governance_changes: Option<GovernanceChange>,
}

impl CheckpointDiff {
    pub fn between(from: &Checkpoint, to: &Checkpoint) -> Self {
        let mut added = Vec::new();
        let mut modified = Vec::new();
        for (name, artifact) in &to.artifacts {
            match from.artifacts.get(name) {
                None => added.push(name.clone()),
                Some(prev) if prev != artifact => modified.push(name.clone()),
                Some(_) => {}
            }
        }
        let removed = from
            .artifacts
            .keys()
            .filter(|name| !to.artifacts.contains_key(*name))
            .cloned()
            .collect();

        let mut phases: Vec<&String> = from
            .state
            .phase_states
            .keys()
            .chain(to.state.phase_states.keys())
            .collect();
        phases.sort();
        phases.dedup();
        let phase_changes = phases
            .into_iter()
            .filter_map(|phase| {
                let before = from.state.phase_states.get(phase).copied();
                let after = to.state.phase_states.get(phase).copied();
                (before != after).then(|| PhaseChange {
                    phase: phase.clone(),
                    before,
                    after,
                })
            })
            .collect();

        let verdict = |g: &Option<GovernanceResult>| {
            g.as_ref()
                .map(|r| (r.passed, r.blocked_gate_ids.clone()))
        };
        let governance_changes = (verdict(&from.governance) != verdict(&to.governance)).then(|| {
            GovernanceChange {
                before: from.governance.clone(),
                after: to.governance.clone(),
            }
        });

        Self {
            from: from.id.clone(),
            to: to.id.clone(),
            added_artifacts: added,
            removed_artifacts: removed,
            modified_artifacts: modified,
            phase_changes,
            governance_changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_artifacts.is_empty()
            && self.removed_artifacts.is_empty()
            && self.modified_artifacts.is_empty()
            && self.phase_changes.is_empty()
            && self.governance_changes.is_none()
    }
}
