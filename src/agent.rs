//! Agent executor seam and per-agent results.
//!
//! What an agent does is entirely up to the `AgentExecutor` implementation.
//! The engine only decides when it is called, with which context, and what
//! happens to the `Outcome` it returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{AgentError, BudgetExceeded};
use crate::phase::PhaseDefinition;
use crate::state::TokenUsage;

/// Inputs visible to one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentContext {
    pub run_id: String,
    pub project_id: String,
    pub phase: String,
    pub agent_id: String,
    /// Run artifacts plus those produced by this agent's dependencies
    pub inputs: Arc<BTreeMap<String, Value>>,
}

impl AgentContext {
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }
}

/// External collaborator that performs an agent's work.
///
/// Return `AgentError::Transient` (or an error whose message carries a
/// transient signature) to have the call retried.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        agent_id: &str,
        phase: &PhaseDefinition,
        context: &AgentContext,
    ) -> Result<Outcome, AgentError>;
}

/// How an agent's dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    /// The executor returned an unsuccessful outcome
    Failed,
    /// The executor raised a non-retryable error
    Fatal,
    RetryExhausted { attempts: u32 },
    BudgetRejected(BudgetExceeded),
    Cancelled,
    /// Not dispatched because an earlier group failed
    Skipped,
}

/// Result of dispatching one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub agent_id: String,
    pub success: bool,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub exit_status: ExitStatus,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Outcome {
    pub fn success(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            success: true,
            artifacts: BTreeMap::new(),
            errors: Vec::new(),
            exit_status: ExitStatus::Success,
            duration: Duration::ZERO,
            token_usage: TokenUsage::default(),
            model_used: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn failure(agent_id: &str, exit_status: ExitStatus, error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            exit_status,
            ..Self::success(agent_id)
        }
    }

    pub fn with_artifact(mut self, name: &str, value: Value) -> Self {
        self.artifacts.insert(name.to_string(), value);
        self
    }

    pub fn with_usage(mut self, input_units: u64, output_units: u64) -> Self {
        self.token_usage = TokenUsage::new(input_units, output_units);
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model_used = Some(model.to_string());
        self
    }

    /// First recorded error, or a description of the exit status.
    pub fn first_error(&self) -> String {
        self.errors
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{:?}", self.exit_status))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_serializes_shared_inputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert("spec".to_string(), json!("v1"));
        let context = AgentContext {
            run_id: "run-1".into(),
            project_id: "alpha".into(),
            phase: "dev".into(),
            agent_id: "coder".into(),
            inputs: Arc::new(inputs),
        };

        let value = serde_json::to_value(&context).unwrap();
        assert_eq!(value["inputs"]["spec"], json!("v1"));
        assert_eq!(context.input("spec"), Some(&json!("v1")));
    }

    #[test]
    fn test_failure_keeps_agent_and_error() {
        let outcome = Outcome::failure("coder", ExitStatus::Fatal, "bad request");
        assert!(!outcome.success);
        assert_eq!(outcome.agent_id, "coder");
        assert_eq!(outcome.first_error(), "bad request");
    }

    #[test]
    fn test_outcome_serializes_duration_as_millis() {
        let mut outcome = Outcome::success("a")
            .with_artifact("plan", json!({"steps": 3}))
            .with_usage(10, 4)
            .with_model("m-1");
        outcome.duration = Duration::from_millis(1500);

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["duration"], json!(1500));
        assert_eq!(value["exit_status"], json!({"kind": "success"}));

        let back: Outcome = serde_json::from_value(value).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_budget_rejected_exit_status_carries_scope() {
        let status = ExitStatus::BudgetRejected(BudgetExceeded {
            scope: "daily".into(),
            limit: 1,
            current: 1,
            requested: 1,
            also_exceeded: vec![],
        });
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["kind"], json!("budget_rejected"));
        assert_eq!(value["scope"], json!("daily"));
    }
}
