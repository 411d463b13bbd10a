//! CLI smoke tests for the maestro binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use async_trait::async_trait;
use predicates::prelude::*;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use maestro::agent::{AgentContext, AgentExecutor, Outcome};
use maestro::engine::{EngineBuilder, RunMetadata};
use maestro::errors::AgentError;
use maestro::phase::{PhaseDefinition, WorkflowDefinition};
use maestro::store::FileStore;

fn maestro() -> Command {
    cargo_bin_cmd!("maestro")
}

fn write_workflow(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("workflow.json");
    fs::write(&path, body).unwrap();
    path
}

const WORKFLOW: &str = r#"{
  "name": "delivery",
  "phases": [
    {"name": "planning", "order": 1, "responsible_agents": ["architect"]},
    {"name": "development", "order": 2,
     "responsible_agents": ["coder", "reviewer", "tester"],
     "dependency_map": {"reviewer": ["coder"], "tester": ["coder"]}}
  ]
}"#;

struct Noop;

#[async_trait]
impl AgentExecutor for Noop {
    async fn execute(
        &self,
        agent_id: &str,
        _phase: &PhaseDefinition,
        _context: &AgentContext,
    ) -> Result<Outcome, AgentError> {
        Ok(Outcome::success(agent_id).with_usage(3, 2))
    }
}

/// Persist a run with one completed phase under `<dir>/.maestro/store`.
fn seed_run(dir: &TempDir) -> String {
    let store = Arc::new(FileStore::new(dir.path().join(".maestro/store")));
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let engine = EngineBuilder::new(Arc::new(Noop))
            .with_store(store)
            .build()
            .await
            .unwrap();
        let workflow = WorkflowDefinition::new(
            "delivery",
            vec![
                PhaseDefinition::new("planning", 1, vec!["architect".into()]),
                PhaseDefinition::new("development", 2, vec!["coder".into()]),
            ],
        )
        .unwrap();
        let run = engine
            .start_run(workflow, RunMetadata::new("alpha"))
            .await
            .unwrap();
        engine.advance_phase().await.unwrap();
        run.run_id
    })
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        maestro().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        maestro().arg("--version").assert().success();
    }
}

mod workflow {
    use super::*;

    #[test]
    fn test_validate_accepts_workflow() {
        let dir = TempDir::new().unwrap();
        let path = write_workflow(&dir, WORKFLOW);

        maestro()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("delivery"));
    }

    #[test]
    fn test_validate_rejects_duplicate_order() {
        let dir = TempDir::new().unwrap();
        let path = write_workflow(
            &dir,
            r#"{"name": "bad", "phases": [
                {"name": "a", "order": 1},
                {"name": "b", "order": 1}
            ]}"#,
        );

        maestro()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&path)
            .assert()
            .failure();
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let dir = TempDir::new().unwrap();
        let path = write_workflow(
            &dir,
            r#"{"name": "loop", "phases": [
                {"name": "dev", "order": 1, "responsible_agents": ["a", "b"],
                 "dependency_map": {"a": ["b"], "b": ["a"]}}
            ]}"#,
        );

        maestro()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("cycle"));
    }

    #[test]
    fn test_plan_prints_groups() {
        let dir = TempDir::new().unwrap();
        let path = write_workflow(&dir, WORKFLOW);

        maestro()
            .current_dir(dir.path())
            .arg("plan")
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("group 0: coder"))
            .stdout(predicate::str::contains("group 1: reviewer, tester"));
    }
}

mod runs {
    use super::*;

    #[test]
    fn test_status_without_runs() {
        let dir = TempDir::new().unwrap();
        maestro()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs found"));
    }

    #[test]
    fn test_status_shows_persisted_run() {
        let dir = TempDir::new().unwrap();
        let run_id = seed_run(&dir);

        maestro()
            .current_dir(dir.path())
            .args(["status", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("development"))
            .stdout(predicate::str::contains("planning"));
    }

    #[test]
    fn test_checkpoints_list_and_diff() {
        let dir = TempDir::new().unwrap();
        let run_id = seed_run(&dir);

        maestro()
            .current_dir(dir.path())
            .args(["checkpoints", "list", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("cp-0000-planning-pre"))
            .stdout(predicate::str::contains("cp-0001-planning-post"));

        maestro()
            .current_dir(dir.path())
            .args([
                "checkpoints",
                "diff",
                &run_id,
                "cp-0000-planning-pre",
                "cp-0001-planning-post",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("phase planning"));
    }

    #[test]
    fn test_status_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        maestro()
            .current_dir(dir.path())
            .args(["status", "nope"])
            .assert()
            .failure();
    }
}

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        maestro()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_workers = 2"));
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();
        maestro()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success();
        assert!(dir.path().join(".maestro/maestro.toml").exists());

        maestro()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    fn test_env_override_is_applied() {
        let dir = TempDir::new().unwrap();
        maestro()
            .current_dir(dir.path())
            .env("MAESTRO_MAX_WORKERS", "7")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_workers = 7"));
    }

    #[test]
    fn test_budget_reports_configured_scope() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".maestro")).unwrap();
        fs::write(
            dir.path().join(".maestro/maestro.toml"),
            "[budget]\n[[budget.scopes]]\nkind = \"project\"\nlimit = 500\n",
        )
        .unwrap();

        maestro()
            .current_dir(dir.path())
            .args(["budget", "--project", "alpha"])
            .assert()
            .success()
            .stdout(predicate::str::contains("project-alpha"))
            .stdout(predicate::str::contains("500"));
    }
}
