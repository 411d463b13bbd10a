//! Run, phase and agent state.
//!
//! `RunState` is owned by the workflow engine and mutated only from the task
//! that holds the run's phase lock. Everything here is plain data; the
//! transitions that enforce the agent state machine live on `AgentState`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::governance::GovernanceResult;

/// Top-level status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no phase has started yet
    #[default]
    Idle,
    /// A phase is executing, or the run is between phases
    Running,
    /// Agents finished; waiting on the governance evaluator
    AwaitingGovernance,
    /// The last phase attempt failed; remediation and a retry are expected
    NeedsRevision,
    /// Aborted by the caller
    Aborted,
    /// Every phase completed
    Completed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Completed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::AwaitingGovernance => "awaiting_governance",
            RunStatus::NeedsRevision => "needs_revision",
            RunStatus::Aborted => "aborted",
            RunStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Status of one phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Optional phase passed over by the caller
    Skipped,
}

impl PhaseStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Agent lifecycle. Forward-only:
/// `Initializing → Planning → Acting → Summarizing → {Complete | Failed}`.
/// `Failed` is reachable from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Initializing,
    Planning,
    Acting,
    Summarizing,
    Complete,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// The single forward successor on the success path.
    pub fn successor(&self) -> Option<AgentStatus> {
        match self {
            AgentStatus::Initializing => Some(AgentStatus::Planning),
            AgentStatus::Planning => Some(AgentStatus::Acting),
            AgentStatus::Acting => Some(AgentStatus::Summarizing),
            AgentStatus::Summarizing => Some(AgentStatus::Complete),
            AgentStatus::Complete | AgentStatus::Failed => None,
        }
    }

    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == AgentStatus::Failed || self.successor() == Some(next)
    }
}

/// Rejected agent status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("agent '{agent_id}' cannot move from {from:?} to {to:?}")]
pub struct InvalidAgentTransition {
    pub agent_id: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Resource units consumed by an agent call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_units: u64,
    pub output_units: u64,
}

impl TokenUsage {
    pub fn new(input_units: u64, output_units: u64) -> Self {
        Self {
            input_units,
            output_units,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_units.saturating_add(self.output_units)
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_units = self.input_units.saturating_add(other.input_units);
        self.output_units = self.output_units.saturating_add(other.output_units);
    }
}

/// Per-agent execution state inside a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub phase: String,
    pub status: AgentStatus,
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentState {
    pub fn new(agent_id: &str, phase: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            phase: phase.to_string(),
            status: AgentStatus::Initializing,
            token_usage: TokenUsage::default(),
            model_used: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `next`, refusing back-edges and moves out of terminal states.
    pub fn transition(&mut self, next: AgentStatus) -> Result<(), InvalidAgentTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidAgentTransition {
                agent_id: self.agent_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Walk the success path through to `Complete`.
    pub fn complete(&mut self) -> Result<(), InvalidAgentTransition> {
        while let Some(next) = self.status.successor() {
            self.transition(next)?;
        }
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidAgentTransition> {
        self.transition(AgentStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}

/// Key of an agent's state in `RunState::agent_states`.
pub fn agent_key(phase: &str, agent_id: &str) -> String {
    format!("{}/{}", phase, agent_id)
}

/// A named output. `phase` is `None` for run inputs supplied at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub producer: String,
    pub value: serde_json::Value,
}

impl Artifact {
    pub fn input(value: serde_json::Value) -> Self {
        Self {
            phase: None,
            producer: "input".to_string(),
            value,
        }
    }

    pub fn produced(phase: &str, producer: &str, value: serde_json::Value) -> Self {
        Self {
            phase: Some(phase.to_string()),
            producer: producer.to_string(),
            value,
        }
    }
}

/// State moved aside by a rollback. Nothing a rollback touches is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// The rollback checkpoint that produced this archive
    pub rollback_checkpoint_id: String,
    /// The checkpoint the run was rolled back to
    pub target_checkpoint_id: String,
    pub phases: Vec<String>,
    #[serde(default)]
    pub phase_states: BTreeMap<String, PhaseStatus>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default)]
    pub agent_states: BTreeMap<String, AgentState>,
    pub archived_at: DateTime<Utc>,
}

/// The subset of run state captured in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub current_phase: String,
    pub completed_phases: Vec<String>,
    pub phase_states: BTreeMap<String, PhaseStatus>,
    pub status: RunStatus,
    pub token_usage: TokenUsage,
}

/// Full state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub project_id: String,
    pub workflow: String,
    pub current_phase: String,
    /// Append-only history of phase completions, in completion order
    pub completed_phases: Vec<String>,
    pub phase_states: BTreeMap<String, PhaseStatus>,
    pub agent_states: BTreeMap<String, AgentState>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    /// Append-only list of checkpoint ids, in creation order
    pub checkpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_checkpoint: Option<String>,
    /// Committed usage per budget counter, refreshed after each phase
    #[serde(default)]
    pub budget_counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub governance: BTreeMap<String, GovernanceResult>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub archives: Vec<ArchiveRecord>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(
        run_id: &str,
        project_id: &str,
        workflow: &str,
        phases: &[String],
        first_phase: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
            workflow: workflow.to_string(),
            current_phase: first_phase.to_string(),
            completed_phases: Vec::new(),
            phase_states: phases
                .iter()
                .map(|p| (p.clone(), PhaseStatus::Pending))
                .collect(),
            agent_states: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            checkpoints: Vec::new(),
            active_checkpoint: None,
            budget_counters: BTreeMap::new(),
            token_usage: TokenUsage::default(),
            governance: BTreeMap::new(),
            status: RunStatus::Idle,
            last_error: None,
            archives: Vec::new(),
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            current_phase: self.current_phase.clone(),
            completed_phases: self.completed_phases.clone(),
            phase_states: self.phase_states.clone(),
            status: self.status,
            token_usage: self.token_usage,
        }
    }

    pub fn phase_status(&self, phase: &str) -> PhaseStatus {
        self.phase_states.get(phase).copied().unwrap_or_default()
    }

    pub fn set_phase_status(&mut self, phase: &str, status: PhaseStatus) {
        self.phase_states.insert(phase.to_string(), status);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_status_happy_path() {
        let mut state = AgentState::new("coder", "development");
        state.complete().unwrap();
        assert_eq!(state.status, AgentStatus::Complete);
    }

    #[test]
    fn test_agent_status_rejects_back_edges() {
        let mut state = AgentState::new("coder", "development");
        state.transition(AgentStatus::Planning).unwrap();
        state.transition(AgentStatus::Acting).unwrap();

        let err = state.transition(AgentStatus::Planning).unwrap_err();
        assert_eq!(err.from, AgentStatus::Acting);
        assert_eq!(err.to, AgentStatus::Planning);
    }

    #[test]
    fn test_agent_status_rejects_skipping_steps() {
        let mut state = AgentState::new("coder", "development");
        assert!(state.transition(AgentStatus::Summarizing).is_err());
        assert_eq!(state.status, AgentStatus::Initializing);
    }

    #[test]
    fn test_agent_fail_from_any_non_terminal() {
        for start in [
            AgentStatus::Initializing,
            AgentStatus::Planning,
            AgentStatus::Acting,
            AgentStatus::Summarizing,
        ] {
            let mut state = AgentState::new("a", "p");
            state.status = start;
            state.fail("boom").unwrap();
            assert_eq!(state.status, AgentStatus::Failed);
            assert_eq!(state.error.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn test_terminal_agent_status_is_final() {
        let mut state = AgentState::new("a", "p");
        state.complete().unwrap();
        assert!(state.fail("late").is_err());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Idle.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::NeedsRevision.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage::new(10, 5);
        usage.add(TokenUsage::new(1, 2));
        assert_eq!(usage.total(), 18);
    }

    #[test]
    fn test_run_state_initial_phase_states() {
        let phases = vec!["planning".to_string(), "qa".to_string()];
        let state = RunState::new("r1", "p1", "wf", &phases, "planning");
        assert_eq!(state.phase_status("planning"), PhaseStatus::Pending);
        assert_eq!(state.phase_status("qa"), PhaseStatus::Pending);
        assert_eq!(state.status, RunStatus::Idle);
        assert!(state.completed_phases.is_empty());
    }

    #[test]
    fn test_run_state_serde_roundtrip_keeps_status() {
        let phases = vec!["planning".to_string()];
        let mut state = RunState::new("r1", "p1", "wf", &phases, "planning");
        state.status = RunStatus::NeedsRevision;
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("needs_revision"));
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
