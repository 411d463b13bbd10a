//! Configuration for maestro, read from `.maestro/maestro.toml`.
//!
//! Layered: file → environment → CLI. Phase-specific overrides are keyed by
//! glob patterns over phase names.
//!
//! # Configuration File Format
//!
//! ```toml
//! [swarm]
//! max_workers = 2
//! fail_fast = true
//! phase_timeout_secs = 0
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! exponential_base = 2.0
//! jitter = true
//!
//! [budget]
//! estimate_per_agent = 1000
//!
//! [[budget.scopes]]
//! kind = "daily"
//! limit = 1000000
//!
//! [[budget.scopes]]
//! kind = "custom"
//! name = "experiment"
//! limit = 50000
//!
//! [storage]
//! dir = ".maestro/store"
//!
//! [phases.overrides."review-*"]
//! max_workers = 4
//! timeout_secs = 600
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::{ScopeKind, ScopeLimit};
use crate::phase::PhaseDefinition;
use crate::retry::RetryConfig;
use crate::swarm::SwarmConfig;

pub const CONFIG_DIR: &str = ".maestro";
pub const CONFIG_FILE: &str = "maestro.toml";

/// Swarm execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSection {
    /// Agents executing at once within a group
    pub max_workers: usize,
    /// Skip later groups once a group has a failure
    pub fail_fast: bool,
    /// Cancel a phase after this many seconds; 0 disables the timeout
    pub phase_timeout_secs: u64,
}

impl Default for SwarmSection {
    fn default() -> Self {
        Self {
            max_workers: 2,
            fail_fast: true,
            phase_timeout_secs: 0,
        }
    }
}

/// Retry/backoff settings for agent calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

/// Budget scopes and the default per-agent estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    /// Units reserved per agent when the phase does not say otherwise
    pub estimate_per_agent: u64,
    pub scopes: Vec<ScopeLimit>,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            estimate_per_agent: 1_000,
            scopes: Vec::new(),
        }
    }
}

/// Where run state, checkpoints and the budget ledger are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Relative paths resolve against the project directory
    pub dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(CONFIG_DIR).join("store"),
        }
    }
}

/// Phase-specific override settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub estimated_units: Option<u64>,
}

/// Phase override configuration section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Pattern-based overrides (e.g., "review-*" -> PhaseOverride)
    #[serde(default)]
    pub overrides: HashMap<String, PhaseOverride>,
}

/// The complete maestro.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaestroToml {
    #[serde(default)]
    pub swarm: SwarmSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub phases: PhasesConfig,
}

/// Resolved settings for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
    pub max_workers: usize,
    pub timeout: Option<Duration>,
    pub estimated_units: u64,
}

impl MaestroToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse maestro.toml")
    }

    /// Load `<maestro_dir>/maestro.toml`, or defaults when it does not exist.
    pub fn load_or_default(maestro_dir: &Path) -> Result<Self> {
        let config_path = maestro_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize maestro.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig::default()
            .with_max_workers(self.swarm.max_workers)
            .with_fail_fast(self.swarm.fail_fast)
    }

    /// Settings for a phase: defaults, then matching overrides (in pattern
    /// order), then the phase definition's own fields.
    pub fn phase_settings(&self, phase: &PhaseDefinition) -> PhaseSettings {
        let mut settings = PhaseSettings {
            max_workers: self.swarm.max_workers,
            timeout: (self.swarm.phase_timeout_secs > 0)
                .then(|| Duration::from_secs(self.swarm.phase_timeout_secs)),
            estimated_units: self.budget.estimate_per_agent,
        };

        let mut patterns: Vec<&String> = self.phases.overrides.keys().collect();
        patterns.sort();
        for pattern in patterns {
            if !pattern_matches(pattern, &phase.name) {
                continue;
            }
            let override_cfg = &self.phases.overrides[pattern];
            if let Some(workers) = override_cfg.max_workers {
                settings.max_workers = workers;
            }
            if let Some(secs) = override_cfg.timeout_secs {
                settings.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if let Some(units) = override_cfg.estimated_units {
                settings.estimated_units = units;
            }
        }

        if let Some(secs) = phase.timeout_secs {
            settings.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(units) = phase.estimated_units {
            settings.estimated_units = units;
        }
        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.swarm.max_workers == 0 {
            warnings.push("swarm.max_workers is 0; agents will run one at a time".to_string());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; every call is attempted once".to_string());
        }
        if self.retry.exponential_base < 1.0 {
            warnings.push(format!(
                "retry.exponential_base {} is below 1.0; delays will shrink",
                self.retry.exponential_base
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            warnings.push(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            ));
        }
        for scope in &self.budget.scopes {
            if scope.limit == 0 {
                warnings.push(format!(
                    "budget scope '{}' has limit 0; every agent will be rejected",
                    scope.label()
                ));
            }
            if scope.kind == ScopeKind::Custom && scope.name.is_none() {
                warnings.push("custom budget scope without a name".to_string());
            }
        }
        for pattern in self.phases.overrides.keys() {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid phase override pattern '{}'", pattern));
            }
        }

        warnings
    }
}

/// Case-insensitive glob match of a phase name against an override pattern.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    glob::Pattern::new(pattern).is_ok_and(|p| p.matches_with(name, options))
}

/// Values supplied on the command line; `None` leaves the lower layer in place.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub store_dir: Option<PathBuf>,
    pub phase_timeout_secs: Option<u64>,
}

/// Unified configuration: maestro.toml, then environment, then CLI.
#[derive(Debug, Clone)]
pub struct MaestroConfig {
    pub project_dir: PathBuf,
    pub maestro_dir: PathBuf,
    pub toml: MaestroToml,
}

impl MaestroConfig {
    /// Load from `<project_dir>/.maestro/maestro.toml` and the process environment.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, |key| std::env::var(key).ok())
    }

    /// Like `new`, reading environment variables through `lookup`.
    pub fn with_env<F>(project_dir: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let maestro_dir = project_dir.join(CONFIG_DIR);
        let mut toml = MaestroToml::load_or_default(&maestro_dir)?;
        apply_env(&mut toml, lookup)?;
        Ok(Self {
            project_dir,
            maestro_dir,
            toml,
        })
    }

    /// Apply CLI overrides on top of file and environment.
    pub fn with_cli_overrides(mut self, cli: CliOverrides) -> Self {
        if let Some(workers) = cli.max_workers {
            self.toml.swarm.max_workers = workers;
        }
        if let Some(attempts) = cli.max_attempts {
            self.toml.retry.max_attempts = attempts;
        }
        if let Some(dir) = cli.store_dir {
            self.toml.storage.dir = dir;
        }
        if let Some(secs) = cli.phase_timeout_secs {
            self.toml.swarm.phase_timeout_secs = secs;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.maestro_dir.join(CONFIG_FILE)
    }

    /// Storage directory, resolved against the project directory.
    pub fn store_dir(&self) -> PathBuf {
        if self.toml.storage.dir.is_absolute() {
            self.toml.storage.dir.clone()
        } else {
            self.project_dir.join(&self.toml.storage.dir)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.maestro_dir.join("logs")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn apply_env<F>(toml: &mut MaestroToml, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("MAESTRO_MAX_WORKERS") {
        toml.swarm.max_workers = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid MAESTRO_MAX_WORKERS '{}'", value))?;
    }
    if let Some(value) = lookup("MAESTRO_MAX_ATTEMPTS") {
        toml.retry.max_attempts = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid MAESTRO_MAX_ATTEMPTS '{}'", value))?;
    }
    if let Some(value) = lookup("MAESTRO_PHASE_TIMEOUT_SECS") {
        toml.swarm.phase_timeout_secs = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid MAESTRO_PHASE_TIMEOUT_SECS '{}'", value))?;
    }
    if let Some(value) = lookup("MAESTRO_STORE_DIR")
        && !value.is_empty()
    {
        toml.storage.dir = PathBuf::from(value);
    }
    Ok(())
}
