//! Phase definitions, workflow loading and the phase manager.
//!
//! This module provides:
//! - `PhaseDefinition`, one ordered stage with its responsible agents
//! - `WorkflowDefinition`, the validated ordered set of phases (JSON or TOML)
//! - `PhaseManager`, which answers "current/next phase" and validates transitions

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::errors::{TransitionRejected, WorkflowError};
use crate::state::RunState;

/// A single ordered workflow stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    /// Unique phase name (e.g., "planning")
    pub name: String,
    /// Position in the workflow; unique and strictly increasing
    pub order: u32,
    /// Agents dispatched when this phase runs
    #[serde(default)]
    pub responsible_agents: Vec<String>,
    /// agent -> agents it waits for within this phase
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency_map: BTreeMap<String, Vec<String>>,
    /// Artifact names that must exist before the phase starts
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Artifact names the phase is expected to produce
    #[serde(default)]
    pub required_outputs: Vec<String>,
    /// Gate ids handed to the governance evaluator
    #[serde(default)]
    pub quality_gates: Vec<String>,
    /// Optional phases may be skipped by the caller
    #[serde(default)]
    pub optional: bool,
    /// Cancel the phase after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Budget units reserved per agent before dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_units: Option<u64>,
}

impl PhaseDefinition {
    pub fn new(name: &str, order: u32, responsible_agents: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            order,
            responsible_agents,
            dependency_map: BTreeMap::new(),
            required_inputs: Vec::new(),
            required_outputs: Vec::new(),
            quality_gates: Vec::new(),
            optional: false,
            timeout_secs: None,
            estimated_units: None,
        }
    }

    /// Declare that `agent` waits for `depends_on`.
    pub fn with_dependency(mut self, agent: &str, depends_on: Vec<String>) -> Self {
        self.dependency_map.insert(agent.to_string(), depends_on);
        self
    }

    pub fn with_required_inputs(mut self, inputs: Vec<String>) -> Self {
        self.required_inputs = inputs;
        self
    }

    pub fn with_required_outputs(mut self, outputs: Vec<String>) -> Self {
        self.required_outputs = outputs;
        self
    }

    pub fn with_quality_gates(mut self, gates: Vec<String>) -> Self {
        self.quality_gates = gates;
        self
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_estimated_units(mut self, units: u64) -> Self {
        self.estimated_units = Some(units);
        self
    }
}

/// An ordered, validated set of phases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub phases: Vec<PhaseDefinition>,
}

impl WorkflowDefinition {
    /// Build a workflow, sorting phases by `order` and validating it.
    pub fn new(name: &str, phases: Vec<PhaseDefinition>) -> Result<Self, WorkflowError> {
        let mut workflow = Self {
            name: name.to_string(),
            description: String::new(),
            phases,
        };
        workflow.normalize()?;
        Ok(workflow)
    }

    /// Load a workflow from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        let mut workflow: WorkflowDefinition =
            if path.extension().is_some_and(|ext| ext == "toml") {
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse workflow TOML: {}", path.display()))?
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse workflow JSON: {}", path.display()))?
            };

        workflow
            .normalize()
            .with_context(|| format!("Invalid workflow: {}", path.display()))?;
        Ok(workflow)
    }

    /// Save the workflow as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize workflow to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write workflow file: {}", path.display()))?;
        Ok(())
    }

    fn normalize(&mut self) -> Result<(), WorkflowError> {
        self.phases.sort_by_key(|p| p.order);
        self.validate()
    }

    /// Check that names are unique and orders strictly increasing.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.phases.is_empty() {
            return Err(WorkflowError::Empty(self.name.clone()));
        }

        let mut names: HashSet<&str> = HashSet::new();
        for phase in &self.phases {
            if !names.insert(phase.name.as_str()) {
                return Err(WorkflowError::DuplicateName(phase.name.clone()));
            }
        }

        for pair in self.phases.windows(2) {
            if pair[1].order <= pair[0].order {
                return Err(WorkflowError::DuplicateOrder {
                    phase: pair[1].name.clone(),
                    other: pair[0].name.clone(),
                    order: pair[1].order,
                });
            }
        }

        Ok(())
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }
}

/// Answers "where is this run" questions over a workflow.
///
/// Transitions are forward-only by `order`. Skipping optional phases is a
/// policy layered on top (`skippable_between`), not part of the base rule.
#[derive(Debug, Clone)]
pub struct PhaseManager {
    workflow: WorkflowDefinition,
}

impl PhaseManager {
    pub fn new(workflow: WorkflowDefinition) -> Result<Self, WorkflowError> {
        workflow.validate()?;
        Ok(Self { workflow })
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    /// The first phase. Validation guarantees one exists.
    pub fn first(&self) -> &PhaseDefinition {
        &self.workflow.phases[0]
    }

    pub fn resolve(&self, name: &str) -> Result<&PhaseDefinition, TransitionRejected> {
        self.workflow
            .phase(name)
            .ok_or_else(|| TransitionRejected::UnknownPhase(name.to_string()))
    }

    pub fn current(&self, state: &RunState) -> Result<&PhaseDefinition, TransitionRejected> {
        self.resolve(&state.current_phase)
    }

    pub fn next(&self, state: &RunState) -> Option<&PhaseDefinition> {
        self.next_after(&state.current_phase)
    }

    /// The phase immediately after `name` by order, if any.
    pub fn next_after(&self, name: &str) -> Option<&PhaseDefinition> {
        let current = self.workflow.phase(name)?;
        self.workflow.phases.iter().find(|p| p.order > current.order)
    }

    /// Forward-only rule: `from` must be completed and `to` must come later.
    pub fn validate_transition(
        &self,
        from: &str,
        to: &str,
        completed: &[String],
    ) -> Result<(), TransitionRejected> {
        let from_phase = self.resolve(from)?;
        let to_phase = self.resolve(to)?;

        if !completed.iter().any(|c| c == from) {
            return Err(TransitionRejected::NotCompleted {
                from: from.to_string(),
            });
        }

        if to_phase.order <= from_phase.order {
            return Err(TransitionRejected::NotForward {
                from: from.to_string(),
                to: to.to_string(),
                from_order: from_phase.order,
                to_order: to_phase.order,
            });
        }

        Ok(())
    }

    /// Phases passed over when jumping from `from` straight to `to`.
    ///
    /// Returns `from` and everything strictly between, all of which must be
    /// optional. `to` must come after `from`.
    pub fn skippable_between(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<&PhaseDefinition>, TransitionRejected> {
        let from_phase = self.resolve(from)?;
        let to_phase = self.resolve(to)?;

        if to_phase.order <= from_phase.order {
            return Err(TransitionRejected::NotForward {
                from: from.to_string(),
                to: to.to_string(),
                from_order: from_phase.order,
                to_order: to_phase.order,
            });
        }

        let skipped: Vec<&PhaseDefinition> = self
            .workflow
            .phases
            .iter()
            .filter(|p| p.order >= from_phase.order && p.order < to_phase.order)
            .collect();

        if let Some(required) = skipped.iter().find(|p| !p.optional) {
            return Err(TransitionRejected::NotOptional(required.name.clone()));
        }

        Ok(skipped)
    }

    /// Phases ordered strictly after `name`.
    pub fn downstream_of(&self, name: &str) -> Vec<&PhaseDefinition> {
        match self.workflow.phase(name) {
            Some(phase) => self
                .workflow
                .phases
                .iter()
                .filter(|p| p.order > phase.order)
                .collect(),
            None => Vec::new(),
        }
    }
}
