//! Workflow definition commands: `maestro validate` and `maestro plan`.

use anyhow::{Context, Result};
use std::path::Path;

use maestro::phase::WorkflowDefinition;
use maestro::swarm::compute_groups;

pub fn cmd_validate(path: &Path) -> Result<()> {
    let workflow = WorkflowDefinition::load(path)?;

    for phase in workflow.phases() {
        compute_groups(&phase.responsible_agents, &phase.dependency_map)
            .with_context(|| format!("Phase '{}' cannot be scheduled", phase.name))?;
    }

    println!(
        "{} workflow '{}' ({} phases)",
        console::style("Valid").green().bold(),
        workflow.name,
        workflow.phases().len()
    );
    Ok(())
}

pub fn cmd_plan(path: &Path) -> Result<()> {
    let workflow = WorkflowDefinition::load(path)?;

    println!();
    println!("{}", console::style(&workflow.name).bold().cyan());
    if !workflow.description.is_empty() {
        println!("{}", workflow.description);
    }
    println!();

    for phase in workflow.phases() {
        let marker = if phase.optional { " (optional)" } else { "" };
        println!("{:>4}  {}{}", phase.order, console::style(&phase.name).bold(), marker);

        match compute_groups(&phase.responsible_agents, &phase.dependency_map) {
            Ok(groups) if groups.is_empty() => {
                println!("      {}", console::style("no agents").dim());
            }
            Ok(groups) => {
                for (index, group) in groups.iter().enumerate() {
                    println!("      group {}: {}", index, group.join(", "));
                }
            }
            Err(e) => println!("      {} {}", console::style("error:").red().bold(), e),
        }

        if !phase.quality_gates.is_empty() {
            println!(
                "      {} {}",
                console::style("gates:").dim(),
                phase.quality_gates.join(", ")
            );
        }
    }
    println!();
    Ok(())
}
