use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{Checkpoint, CheckpointDiff, CheckpointKind, CheckpointSummary};
use crate::errors::CheckpointError;
use crate::governance::GovernanceResult;
use crate::phase::PhaseManager;
use crate::state::{ArchiveRecord, PhaseStatus, RunState, RunStatus};
use crate::store::{Store, get_typed, put_typed};

const ACTIVE_NAMESPACE: &str = "active";

fn checkpoints_namespace(run_id: &str) -> String {
    format!("checkpoints/{}", run_id)
}

fn archives_namespace(run_id: &str) -> String {
    format!("archives/{}", run_id)
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivePointer {
    checkpoint_id: String,
}

/// Persists checkpoints and performs rollbacks.
///
/// Writes for all runs are serialized through one lock so that sequence
/// numbers are allocated without gaps or duplicates.
pub struct CheckpointManager {
    store: Arc<dyn Store>,
    write_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Snapshot `state` as a new checkpoint and make it the active one.
    ///
    /// The parent is the run's active checkpoint at the time of the call.
    pub async fn save_checkpoint(
        &self,
        state: &mut RunState,
        phase: &str,
        kind: CheckpointKind,
        governance: Option<GovernanceResult>,
    ) -> Result<Checkpoint, CheckpointError> {
        self.write(state, phase, kind, governance, None, None).await
    }

    /// Allocate the next id and persist the checkpoint.
    ///
    /// A rollback's archive record is written first, keyed by the new id, so a
    /// failed archive write never leaves a checkpoint the run does not know about.
    async fn write(
        &self,
        state: &mut RunState,
        phase: &str,
        kind: CheckpointKind,
        governance: Option<GovernanceResult>,
        rolled_back_to: Option<String>,
        archive: Option<&mut ArchiveRecord>,
    ) -> Result<Checkpoint, CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let namespace = checkpoints_namespace(&state.run_id);

        let sequence = self.store.list(&namespace).await?.len() as u64;
        let id = format!("cp-{:04}-{}-{}", sequence, phase, kind);
        if self.store.get(&namespace, &id).await?.is_some() {
            return Err(CheckpointError::AlreadyExists { id });
        }

        let checkpoint = Checkpoint {
            id: id.clone(),
            run_id: state.run_id.clone(),
            sequence,
            phase: phase.to_string(),
            kind,
            parent_checkpoint_id: state.active_checkpoint.clone(),
            rolled_back_to,
            state: state.snapshot(),
            agent_states: state.agent_states.clone(),
            artifacts: state.artifacts.clone(),
            governance,
            created_at: Utc::now(),
        };

        if let Some(archive) = archive {
            archive.rollback_checkpoint_id = id.clone();
            put_typed(
                self.store.as_ref(),
                &archives_namespace(&state.run_id),
                &id,
                &*archive,
            )
            .await?;
        }
        put_typed(self.store.as_ref(), &namespace, &id, &checkpoint).await?;
        put_typed(
            self.store.as_ref(),
            ACTIVE_NAMESPACE,
            &state.run_id,
            &ActivePointer {
                checkpoint_id: id.clone(),
            },
        )
        .await?;

        state.checkpoints.push(id.clone());
        state.active_checkpoint = Some(id);
        state.touch();

        debug!(
            run_id = %checkpoint.run_id,
            checkpoint = %checkpoint.id,
            kind = %kind,
            parent = ?checkpoint.parent_checkpoint_id,
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    pub async fn load_checkpoint(&self, run_id: &str, id: &str) -> Result<Checkpoint, CheckpointError> {
        get_typed(self.store.as_ref(), &checkpoints_namespace(run_id), id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound {
                run_id: run_id.to_string(),
                id: id.to_string(),
            })
    }

    /// Every checkpoint of a run, in creation order.
    pub async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let namespace = checkpoints_namespace(run_id);
        let mut summaries = Vec::new();
        for key in self.store.list(&namespace).await? {
            if let Some(checkpoint) =
                get_typed::<Checkpoint>(self.store.as_ref(), &namespace, &key).await?
            {
                summaries.push(checkpoint.summary());
            }
        }
        summaries.sort_by_key(|s| s.sequence);
        Ok(summaries)
    }

    /// The persisted active checkpoint pointer for a run.
    pub async fn active_checkpoint(&self, run_id: &str) -> Result<Option<String>, CheckpointError> {
        let pointer: Option<ActivePointer> =
            get_typed(self.store.as_ref(), ACTIVE_NAMESPACE, run_id).await?;
        Ok(pointer.map(|p| p.checkpoint_id))
    }

    /// Restore `state` to checkpoint `target_id`.
    ///
    /// Artifacts, agent states and phase states of every phase the target had
    /// not finished are moved into an `ArchiveRecord`. A new `Rollback`
    /// checkpoint records the event; no existing checkpoint is touched.
    #[instrument(skip(self, state, phases), fields(run_id = %state.run_id))]
    pub async fn rollback(
        &self,
        state: &mut RunState,
        phases: &PhaseManager,
        target_id: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let target = self.load_checkpoint(&state.run_id, target_id).await?;

        let target_phase = phases.resolve(&target.phase).map_err(|_| {
            CheckpointError::UnknownPhase {
                id: target.id.clone(),
                phase: target.phase.clone(),
            }
        })?;
        phases
            .resolve(&target.state.current_phase)
            .map_err(|_| CheckpointError::UnknownPhase {
                id: target.id.clone(),
                phase: target.state.current_phase.clone(),
            })?;

        let target_done = target
            .state
            .phase_states
            .get(&target_phase.name)
            .is_some_and(PhaseStatus::is_done);
        let mut downstream: BTreeSet<String> = phases
            .downstream_of(&target_phase.name)
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        if !target_done {
            downstream.insert(target_phase.name.clone());
        }

        let mut archive = ArchiveRecord {
            rollback_checkpoint_id: String::new(),
            target_checkpoint_id: target.id.clone(),
            phases: downstream.iter().cloned().collect(),
            phase_states: state
                .phase_states
                .iter()
                .filter(|(phase, _)| downstream.contains(*phase))
                .map(|(phase, status)| (phase.clone(), *status))
                .collect(),
            artifacts: state
                .artifacts
                .iter()
                .filter(|(_, a)| a.phase.as_ref().is_some_and(|p| downstream.contains(p)))
                .map(|(name, a)| (name.clone(), a.clone()))
                .collect(),
            agent_states: state
                .agent_states
                .iter()
                .filter(|(_, a)| downstream.contains(&a.phase))
                .map(|(key, a)| (key.clone(), a.clone()))
                .collect(),
            archived_at: Utc::now(),
        };

        state.current_phase = target.state.current_phase.clone();
        state.phase_states = target.state.phase_states.clone();
        state.agent_states = target.agent_states.clone();
        state.artifacts = target.artifacts.clone();
        state.governance.retain(|phase, _| !downstream.contains(phase));
        state.status = match target.state.status {
            RunStatus::Completed => RunStatus::Completed,
            RunStatus::Idle => RunStatus::Idle,
            _ => RunStatus::Running,
        };
        state.last_error = None;

        let checkpoint = self
            .write(
                state,
                &target.phase,
                CheckpointKind::Rollback,
                target.governance.clone(),
                Some(target.id.clone()),
                Some(&mut archive),
            )
            .await?;
        state.archives.push(archive);

        info!(
            target = %target.id,
            checkpoint = %checkpoint.id,
            archived_phases = ?downstream,
            "rolled back"
        );
        Ok(checkpoint)
    }

    pub async fn compare(&self, run_id: &str, a: &str, b: &str) -> Result<CheckpointDiff, CheckpointError> {
        let from = self.load_checkpoint(run_id, a).await?;
        let to = self.load_checkpoint(run_id, b).await?;
        Ok(CheckpointDiff::between(&from, &to))
    }

    /// Archive records written by rollbacks of a run, keyed by rollback checkpoint id.
    pub async fn archives(&self, run_id: &str) -> Result<BTreeMap<String, ArchiveRecord>, CheckpointError> {
        let namespace = archives_namespace(run_id);
        let mut archives = BTreeMap::new();
        for key in self.store.list(&namespace).await? {
            if let Some(record) = get_typed(self.store.as_ref(), &namespace, &key).await? {
                archives.insert(key, record);
            }
        }
        Ok(archives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{PhaseDefinition, WorkflowDefinition};
    use crate::state::{AgentState, Artifact, agent_key};
    use crate::errors::StoreError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    fn phases() -> PhaseManager {
        PhaseManager::new(
            WorkflowDefinition::new(
                "wf",
                vec![
                    PhaseDefinition::new("planning", 1, vec!["architect".into()]),
                    PhaseDefinition::new("development", 2, vec!["coder".into()]),
                    PhaseDefinition::new("qa", 3, vec!["tester".into()]),
                ],
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn run() -> RunState {
        let names = phases().workflow().phase_names();
        RunState::new("run-1", "proj", "wf", &names, "planning")
    }

    fn complete_phase(state: &mut RunState, phase: &str, agent: &str, next: &str) {
        let mut agent_state = AgentState::new(agent, phase);
        agent_state.complete().unwrap();
        state.agent_states.insert(agent_key(phase, agent), agent_state);
        state.artifacts.insert(
            format!("{}_out", phase),
            Artifact::produced(phase, agent, json!(phase)),
        );
        state.set_phase_status(phase, PhaseStatus::Completed);
        state.completed_phases.push(phase.to_string());
        state.current_phase = next.to_string();
    }

    #[tokio::test]
    async fn test_save_links_parent_and_sets_active() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
        let mut state = run();

        let first = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Pre, None)
            .await
            .unwrap();
        let second = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Post, None)
            .await
            .unwrap();

        assert_eq!(first.sequence, 0);
        assert!(first.parent_checkpoint_id.is_none());
        assert_eq!(second.parent_checkpoint_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(state.checkpoints, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(state.active_checkpoint.as_deref(), Some(second.id.as_str()));
        assert_eq!(
            manager.active_checkpoint("run-1").await.unwrap(),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_load_missing_checkpoint() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
        let err = manager.load_checkpoint("run-1", "nope").await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_rollback_archives_downstream_and_appends() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
        let phases = phases();
        let mut state = run();

        manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Pre, None)
            .await
            .unwrap();
        complete_phase(&mut state, "planning", "architect", "development");
        let post_planning = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Post, None)
            .await
            .unwrap();
        complete_phase(&mut state, "development", "coder", "qa");
        manager
            .save_checkpoint(&mut state, "development", CheckpointKind::Post, None)
            .await
            .unwrap();

        let rollback = manager
            .rollback(&mut state, &phases, &post_planning.id)
            .await
            .unwrap();

        assert_eq!(rollback.kind, CheckpointKind::Rollback);
        assert_eq!(rollback.rolled_back_to.as_deref(), Some(post_planning.id.as_str()));
        assert_eq!(manager.list_checkpoints("run-1").await.unwrap().len(), 4);

        assert_eq!(state.current_phase, "development");
        assert!(state.artifacts.contains_key("planning_out"));
        assert!(!state.artifacts.contains_key("development_out"));
        assert_eq!(state.phase_status("development"), PhaseStatus::Pending);
        assert_eq!(
            state.completed_phases,
            vec!["planning".to_string(), "development".to_string()]
        );

        let archive = state.archives.last().unwrap();
        assert_eq!(archive.phases, vec!["development", "qa"]);
        assert!(archive.artifacts.contains_key("development_out"));
        assert!(archive.agent_states.contains_key("development/coder"));
        let stored = manager.archives("run-1").await.unwrap();
        assert_eq!(stored.get(&rollback.id), Some(archive));
    }

    /// Memory store that refuses writes to archive namespaces.
    struct ArchiveWritesFail(MemoryStore);

    #[async_trait]
    impl Store for ArchiveWritesFail {
        async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
            self.0.get(namespace, key).await
        }

        async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
            if namespace.starts_with("archives/") {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            self.0.put(namespace, key, value).await
        }

        async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
            self.0.list(namespace).await
        }

        async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
            self.0.delete(namespace, key).await
        }
    }

    #[tokio::test]
    async fn test_failed_archive_write_leaves_no_rollback_checkpoint() {
        let manager = CheckpointManager::new(Arc::new(ArchiveWritesFail(MemoryStore::new())));
        let phases = phases();
        let mut state = run();

        let pre = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Pre, None)
            .await
            .unwrap();
        complete_phase(&mut state, "planning", "architect", "development");
        let post = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Post, None)
            .await
            .unwrap();

        let mut attempt = state.clone();
        let err = manager
            .rollback(&mut attempt, &phases, &pre.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Store(_)));

        let stored: Vec<String> = manager
            .list_checkpoints("run-1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(stored, vec![pre.id.clone(), post.id.clone()]);
        assert_eq!(
            manager.active_checkpoint("run-1").await.unwrap(),
            Some(post.id)
        );
        assert_eq!(attempt.checkpoints, state.checkpoints);
    }

    #[tokio::test]
    async fn test_rollback_to_pre_archives_target_phase() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
        let phases = phases();
        let mut state = run();

        let pre = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Pre, None)
            .await
            .unwrap();
        complete_phase(&mut state, "planning", "architect", "development");

        manager.rollback(&mut state, &phases, &pre.id).await.unwrap();

        assert_eq!(state.current_phase, "planning");
        assert!(state.artifacts.is_empty());
        assert_eq!(
            state.archives[0].phases,
            vec!["development", "planning", "qa"]
        );
    }

    #[tokio::test]
    async fn test_compare_checkpoints() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::new()));
        let mut state = run();

        let a = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Pre, None)
            .await
            .unwrap();
        complete_phase(&mut state, "planning", "architect", "development");
        let b = manager
            .save_checkpoint(&mut state, "planning", CheckpointKind::Post, None)
            .await
            .unwrap();

        let diff = manager.compare("run-1", &a.id, &b.id).await.unwrap();
        assert_eq!(diff.added_artifacts, vec!["planning_out"]);
        assert_eq!(diff.phase_changes.len(), 1);
    }
}
