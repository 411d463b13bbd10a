//! Dependency-aware parallel execution of a phase's agents.
//!
//! ## Components
//!
//! - [`scheduler`]: grouped topological ordering of agents
//! - [`executor`]: runs the groups with bounded concurrency, budget admission and retry
//!
//! ## Usage
//!
//! ```no_run
//! use maestro::agent::{AgentContext, AgentExecutor, Outcome};
//! use maestro::errors::AgentError;
//! use maestro::phase::PhaseDefinition;
//! use maestro::swarm::{PhaseDispatch, SwarmConfig, SwarmScheduler};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl AgentExecutor for Echo {
//!     async fn execute(
//!         &self,
//!         agent_id: &str,
//!         _phase: &PhaseDefinition,
//!         _context: &AgentContext,
//!     ) -> Result<Outcome, AgentError> {
//!         Ok(Outcome::success(agent_id))
//!     }
//! }
//!
//! # async fn example() -> Result<(), maestro::errors::SwarmError> {
//! let phase = PhaseDefinition::new("development", 2, vec!["coder".into(), "reviewer".into()])
//!     .with_dependency("reviewer", vec!["coder".into()]);
//!
//! let swarm = SwarmScheduler::new(Arc::new(Echo))
//!     .with_config(SwarmConfig::default().with_max_workers(4));
//! let report = swarm
//!     .execute(PhaseDispatch::new("run-1", "project", phase), &CancellationToken::new())
//!     .await?;
//!
//! assert_eq!(report.groups, vec![vec!["coder"], vec!["reviewer"]]);
//! # Ok(())
//! # }
//! ```

pub mod executor;
pub mod scheduler;

pub use executor::{InputCache, PhaseDispatch, SwarmConfig, SwarmReport, SwarmScheduler};
pub use scheduler::compute_groups;
