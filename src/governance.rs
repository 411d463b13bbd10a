//! Governance evaluation seam.
//!
//! Gate rules live outside the engine. The engine only needs a pass/fail
//! verdict and the ids of the gates that blocked.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::PhaseDefinition;
use crate::state::RunState;

/// Verdict of a governance evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceResult {
    pub passed: bool,
    #[serde(default)]
    pub blocked_gate_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GovernanceResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            blocked_gate_ids: Vec::new(),
            notes: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn blocked(gate_ids: Vec<String>) -> Self {
        Self {
            passed: gate_ids.is_empty(),
            blocked_gate_ids: gate_ids,
            notes: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// External gate evaluator consulted after every phase's agents succeed.
///
/// An `Err` means the evaluator itself could not run; a blocked phase is an
/// `Ok` result with `passed == false`.
#[async_trait]
pub trait GovernanceEvaluator: Send + Sync {
    async fn evaluate(&self, run: &RunState, phase: &PhaseDefinition) -> Result<GovernanceResult>;
}

/// Evaluator that passes every phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPass;

#[async_trait]
impl GovernanceEvaluator for AlwaysPass {
    async fn evaluate(&self, _run: &RunState, _phase: &PhaseDefinition) -> Result<GovernanceResult> {
        Ok(GovernanceResult::pass())
    }
}

/// Blocks a phase whose `required_outputs` were not produced by that phase.
///
/// Gate ids take the form `required_outputs:<name>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredOutputsGate;

#[async_trait]
impl GovernanceEvaluator for RequiredOutputsGate {
    async fn evaluate(&self, run: &RunState, phase: &PhaseDefinition) -> Result<GovernanceResult> {
        let blocked: Vec<String> = phase
            .required_outputs
            .iter()
            .filter(|name| {
                !run.artifacts
                    .get(name.as_str())
                    .is_some_and(|a| a.phase.as_deref() == Some(phase.name.as_str()))
            })
            .map(|name| format!("required_outputs:{}", name))
            .collect();

        Ok(GovernanceResult::blocked(blocked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Artifact;

    fn run_with_artifact(name: &str, phase: &str) -> RunState {
        let mut run = RunState::new("r", "p", "wf", &["dev".to_string()], "dev");
        run.artifacts.insert(
            name.to_string(),
            Artifact::produced(phase, "coder", serde_json::json!("ok")),
        );
        run
    }

    #[tokio::test]
    async fn test_always_pass() {
        let run = RunState::new("r", "p", "wf", &["dev".to_string()], "dev");
        let phase = PhaseDefinition::new("dev", 1, vec![]);
        let result = AlwaysPass.evaluate(&run, &phase).await.unwrap();
        assert!(result.passed);
        assert!(result.blocked_gate_ids.is_empty());
    }

    #[tokio::test]
    async fn test_required_outputs_gate_passes_when_produced() {
        let run = run_with_artifact("patch", "dev");
        let phase =
            PhaseDefinition::new("dev", 1, vec![]).with_required_outputs(vec!["patch".into()]);
        let result = RequiredOutputsGate.evaluate(&run, &phase).await.unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_required_outputs_gate_blocks_missing_output() {
        let run = run_with_artifact("patch", "planning");
        let phase = PhaseDefinition::new("dev", 1, vec![])
            .with_required_outputs(vec!["patch".into(), "tests".into()]);
        let result = RequiredOutputsGate.evaluate(&run, &phase).await.unwrap();
        assert!(!result.passed);
        assert_eq!(
            result.blocked_gate_ids,
            vec!["required_outputs:patch", "required_outputs:tests"]
        );
    }
}
