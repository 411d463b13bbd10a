//! Configuration view and validation commands: `maestro config`.

use anyhow::{Context, Result};

use maestro::config::{MaestroConfig, MaestroToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &MaestroConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Maestro Configuration").bold().cyan());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No maestro.toml at {} (using defaults)", config_path.display());
            }
            println!();

            let toml = &config.toml;
            println!("[swarm]");
            println!("  max_workers = {}", toml.swarm.max_workers);
            println!("  fail_fast = {}", toml.swarm.fail_fast);
            println!("  phase_timeout_secs = {}", toml.swarm.phase_timeout_secs);
            println!();

            println!("[retry]");
            println!("  max_attempts = {}", toml.retry.max_attempts);
            println!("  initial_delay_ms = {}", toml.retry.initial_delay_ms);
            println!("  max_delay_ms = {}", toml.retry.max_delay_ms);
            println!("  exponential_base = {}", toml.retry.exponential_base);
            println!("  jitter = {}", toml.retry.jitter);
            println!();

            println!("[budget]");
            println!("  estimate_per_agent = {}", toml.budget.estimate_per_agent);
            if toml.budget.scopes.is_empty() {
                println!("  {}", console::style("no scopes (unlimited)").dim());
            }
            for scope in &toml.budget.scopes {
                println!("  {} limit = {}", scope.label(), scope.limit);
            }
            println!();

            if !toml.phases.overrides.is_empty() {
                println!("[phases.overrides]");
                let mut patterns: Vec<_> = toml.phases.overrides.iter().collect();
                patterns.sort_by(|a, b| a.0.cmp(b.0));
                for (pattern, override_cfg) in patterns {
                    println!("  \"{}\":", pattern);
                    if let Some(workers) = override_cfg.max_workers {
                        println!("    max_workers = {}", workers);
                    }
                    if let Some(secs) = override_cfg.timeout_secs {
                        println!("    timeout_secs = {}", secs);
                    }
                    if let Some(units) = override_cfg.estimated_units {
                        println!("    estimated_units = {}", units);
                    }
                }
                println!();
            }

            println!("Store directory: {}", config.store_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("maestro.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.maestro_dir).with_context(|| {
                format!("Failed to create {}", config.maestro_dir.display())
            })?;
            MaestroToml::default().save(&config_path)?;
            println!("Created maestro.toml at {}", config_path.display());
        }
    }

    Ok(())
}
