use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use maestro::config::{CliOverrides, MaestroConfig};
use maestro::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "maestro")]
#[command(version, about = "Inspect multi-agent workflow runs")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Store directory. Overrides maestro.toml and MAESTRO_STORE_DIR.
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    /// Maximum concurrent agents per group
    #[arg(long, global = true)]
    pub max_workers: Option<usize>,

    /// Log output format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,

    /// Also write JSON logs to a daily file under .maestro/logs
    #[arg(long, global = true)]
    pub log_file: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow definition (JSON or TOML)
    Validate { workflow: PathBuf },
    /// Print the execution groups of every phase in a workflow
    Plan { workflow: PathBuf },
    /// Show a persisted run, or list runs when no id is given
    Status { run_id: Option<String> },
    /// Inspect a run's checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Show budget usage and headroom for a project
    Budget {
        #[arg(long)]
        project: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// List checkpoints in creation order
    List { run_id: String },
    /// Diff two checkpoints of a run
    Diff { run_id: String, from: String, to: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default maestro.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = MaestroConfig::new(project_dir)?.with_cli_overrides(CliOverrides {
        max_workers: cli.max_workers,
        store_dir: cli.store_dir.clone(),
        ..CliOverrides::default()
    });

    let log_dir = config.log_dir();
    let _log_guard = logging::init(cli.log_format, cli.log_file.then_some(log_dir.as_path()));

    match &cli.command {
        Commands::Validate { workflow } => cmd::cmd_validate(workflow)?,
        Commands::Plan { workflow } => cmd::cmd_plan(workflow)?,
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id.as_deref()).await?,
        Commands::Checkpoints { command } => cmd::cmd_checkpoints(&config, command).await?,
        Commands::Budget { project } => cmd::cmd_budget(&config, project).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
