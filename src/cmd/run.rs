//! Read-only views over persisted runs: status, checkpoints and budget.

use anyhow::{Context, Result};
use std::sync::Arc;

use maestro::budget::{BudgetEnforcer, ScopeContext};
use maestro::checkpoint::CheckpointManager;
use maestro::config::MaestroConfig;
use maestro::engine::{list_runs, load_run};
use maestro::state::{PhaseStatus, RunStatus};
use maestro::store::{FileStore, Store};

use super::super::CheckpointCommands;

fn open_store(config: &MaestroConfig) -> Arc<dyn Store> {
    Arc::new(FileStore::new(config.store_dir()))
}

fn status_style(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Completed => console::style(text).green(),
        RunStatus::NeedsRevision | RunStatus::Aborted => console::style(text).red(),
        RunStatus::AwaitingGovernance => console::style(text).yellow(),
        RunStatus::Idle | RunStatus::Running => console::style(text).cyan(),
    }
}

pub async fn cmd_status(config: &MaestroConfig, run_id: Option<&str>) -> Result<()> {
    let store = open_store(config);

    let Some(run_id) = run_id else {
        let runs = list_runs(store.as_ref()).await?;
        if runs.is_empty() {
            println!("No runs found in {}", config.store_dir().display());
            return Ok(());
        }
        println!("{:<38} {:<20} {:<18} Current phase", "Run", "Workflow", "Status");
        for id in runs {
            let run = load_run(store.as_ref(), &id).await?;
            println!(
                "{:<38} {:<20} {:<18} {}",
                run.run_id,
                run.workflow,
                status_style(run.status),
                run.current_phase
            );
        }
        return Ok(());
    };

    let run = load_run(store.as_ref(), run_id)
        .await
        .with_context(|| format!("Failed to load run {}", run_id))?;

    println!();
    println!("{}", console::style(format!("Run {}", run.run_id)).bold().cyan());
    println!("Workflow:      {}", run.workflow);
    println!("Project:       {}", run.project_id);
    println!("Status:        {}", status_style(run.status));
    println!("Current phase: {}", run.current_phase);
    println!("Completed:     {}", run.completed_phases.join(" -> "));
    println!(
        "Usage:         {} in / {} out",
        run.token_usage.input_units, run.token_usage.output_units
    );
    if let Some(active) = &run.active_checkpoint {
        println!("Checkpoint:    {}", active);
    }
    if let Some(err) = &run.last_error {
        println!("{} {}", console::style("Last error:").red().bold(), err);
    }
    println!();

    println!("{:<24} Status", "Phase");
    for (phase, status) in &run.phase_states {
        let styled = match status {
            PhaseStatus::Completed => console::style(format!("{:?}", status)).green(),
            PhaseStatus::Failed => console::style(format!("{:?}", status)).red(),
            PhaseStatus::Skipped => console::style(format!("{:?}", status)).dim(),
            PhaseStatus::Pending | PhaseStatus::Running => {
                console::style(format!("{:?}", status))
            }
        };
        println!("{:<24} {}", phase, styled);
    }

    if !run.agent_states.is_empty() {
        println!();
        println!("{:<32} {:<14} Units", "Agent", "Status");
        for (key, agent) in &run.agent_states {
            println!(
                "{:<32} {:<14} {}",
                key,
                format!("{:?}", agent.status),
                agent.token_usage.total()
            );
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_checkpoints(config: &MaestroConfig, command: &CheckpointCommands) -> Result<()> {
    let checkpoints = CheckpointManager::new(open_store(config));

    match command {
        CheckpointCommands::List { run_id } => {
            let summaries = checkpoints.list_checkpoints(run_id).await?;
            if summaries.is_empty() {
                println!("No checkpoints for run {}", run_id);
                return Ok(());
            }
            let active = checkpoints.active_checkpoint(run_id).await?;

            println!(
                "{:<4} {:<36} {:<10} {:<18} Parent",
                "Seq", "Id", "Kind", "Status"
            );
            for summary in summaries {
                let marker = if active.as_deref() == Some(summary.id.as_str()) {
                    console::style("*").green().bold().to_string()
                } else {
                    " ".to_string()
                };
                println!(
                    "{:<4} {:<36} {:<10} {:<18} {}{}",
                    summary.sequence,
                    summary.id,
                    summary.kind.to_string(),
                    summary.status.to_string(),
                    summary.parent_checkpoint_id.as_deref().unwrap_or("-"),
                    marker
                );
            }
        }
        CheckpointCommands::Diff { run_id, from, to } => {
            let diff = checkpoints.compare(run_id, from, to).await?;
            println!("{} -> {}", diff.from, diff.to);
            if diff.is_empty() {
                println!("{}", console::style("no differences").dim());
                return Ok(());
            }
            for name in &diff.added_artifacts {
                println!("  {} {}", console::style("+").green(), name);
            }
            for name in &diff.removed_artifacts {
                println!("  {} {}", console::style("-").red(), name);
            }
            for name in &diff.modified_artifacts {
                println!("  {} {}", console::style("~").yellow(), name);
            }
            for change in &diff.phase_changes {
                println!(
                    "  phase {}: {:?} -> {:?}",
                    change.phase, change.before, change.after
                );
            }
            if let Some(change) = &diff.governance_changes {
                let verdict = |g: &Option<maestro::governance::GovernanceResult>| match g {
                    Some(r) if r.passed => "passed".to_string(),
                    Some(r) => format!("blocked {:?}", r.blocked_gate_ids),
                    None => "none".to_string(),
                };
                println!(
                    "  governance: {} -> {}",
                    verdict(&change.before),
                    verdict(&change.after)
                );
            }
        }
    }
    Ok(())
}

pub async fn cmd_budget(config: &MaestroConfig, project: &str) -> Result<()> {
    let budget = BudgetEnforcer::new(config.toml.budget.scopes.clone()).with_store(open_store(config));
    budget.load().await?;

    let report = budget.report(&ScopeContext::new(project)).await;
    if report.scopes.is_empty() {
        println!("No budget scopes configured; admission is unlimited.");
        return Ok(());
    }

    println!(
        "{:<16} {:<24} {:>12} {:>12} {:>12}",
        "Scope", "Counter", "Limit", "Used", "Remaining"
    );
    for scope in report.scopes {
        let remaining = if scope.remaining == 0 {
            console::style(scope.remaining.to_string()).red()
        } else {
            console::style(scope.remaining.to_string()).green()
        };
        println!(
            "{:<16} {:<24} {:>12} {:>12} {:>12}",
            scope.scope, scope.counter, scope.limit, scope.used, remaining
        );
    }
    Ok(())
}
