//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::{SessionContext, SessionNaming};
use crate::{AppError, Result};

/// How to launch worker processes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Worker executable.
    pub command: String,
    /// Base arguments passed to every worker.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides layered on the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-call response deadline.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Minimum spacing between restart attempts of one session.
    #[serde(default = "default_restart_cooldown_seconds")]
    pub restart_cooldown_seconds: u64,
    /// Wait between graceful and forced termination.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_restart_cooldown_seconds() -> u64 {
    300
}

fn default_kill_grace_ms() -> u64 {
    3000
}

/// Dispatch loop settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DispatchConfig {
    /// Ownership prefix for session names.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Seconds between dispatch cycles.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Shared root for working-directory fallbacks.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Refuse to start workers without a configured directory.
    #[serde(default)]
    pub strict_directories: bool,
    /// Busy workers silent this long are restarted; 0 disables the check.
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,
    /// JSON work list read each cycle.
    #[serde(default)]
    pub work_file: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            session_prefix: default_session_prefix(),
            poll_interval_seconds: default_poll_interval_seconds(),
            workspace_root: None,
            strict_directories: false,
            stale_after_seconds: default_stale_after_seconds(),
            work_file: None,
        }
    }
}

fn default_session_prefix() -> String {
    "dispatch_".into()
}

fn default_poll_interval_seconds() -> u64 {
    60
}

fn default_stale_after_seconds() -> u64 {
    900
}

fn default_true() -> bool {
    true
}

/// Per-project settings from a `[[project]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProjectSettings {
    /// External project identifier.
    pub id: String,
    /// Display name; also matched against work item names.
    #[serde(default)]
    pub name: Option<String>,
    /// Disabled projects never receive work.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Explicit working directory.
    #[serde(default)]
    pub repo_path: Option<String>,
    /// `--provider` passed to the worker.
    #[serde(default)]
    pub provider: Option<String>,
    /// `--model` passed to the worker.
    #[serde(default)]
    pub model: Option<String>,
    /// Per-call timeout override.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Restart cooldown override.
    #[serde(default)]
    pub restart_cooldown_seconds: Option<u64>,
}

impl ProjectSettings {
    /// Copy launch overrides into `context`.
    pub fn apply_to(&self, context: &mut SessionContext) {
        context.repo_path.clone_from(&self.repo_path);
        context.provider.clone_from(&self.provider);
        context.model.clone_from(&self.model);
        context.timeout = self.timeout_seconds.map(Duration::from_secs);
        context.restart_cooldown = self.restart_cooldown_seconds.map(Duration::from_secs);
    }
}

/// Hot-reloadable project settings and directory overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectTable {
    /// Configured projects.
    pub projects: Vec<ProjectSettings>,
    /// Project id or name to working directory.
    pub directory_overrides: HashMap<String, String>,
}

impl ProjectTable {
    /// Find settings by project id, falling back to project name.
    #[must_use]
    pub fn lookup(&self, project_id: &str, project_name: &str) -> Option<&ProjectSettings> {
        self.projects
            .iter()
            .find(|p| p.id == project_id)
            .or_else(|| {
                self.projects
                    .iter()
                    .find(|p| p.name.as_deref() == Some(project_name))
            })
    }

    /// Unconfigured projects are enabled.
    #[must_use]
    pub fn is_enabled(&self, project_id: &str, project_name: &str) -> bool {
        self.lookup(project_id, project_name)
            .is_none_or(|p| p.enabled)
    }

    /// Reject empty and duplicate project ids.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the offending id.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if project.id.trim().is_empty() {
                return Err(AppError::Config("project id must not be empty".into()));
            }
            if !seen.insert(project.id.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate project id '{}'",
                    project.id
                )));
            }
            if project.timeout_seconds == Some(0) {
                return Err(AppError::Config(format!(
                    "project '{}': timeout_seconds must be greater than zero",
                    project.id
                )));
            }
        }
        Ok(())
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Worker launch settings.
    pub worker: WorkerConfig,
    /// Dispatch loop settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Project id or name to working directory.
    #[serde(default)]
    pub directory_overrides: HashMap<String, String>,
    /// Per-project settings.
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectSettings>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Snapshot of the hot-reloadable sections.
    #[must_use]
    pub fn project_table(&self) -> ProjectTable {
        ProjectTable {
            projects: self.projects.clone(),
            directory_overrides: self.directory_overrides.clone(),
        }
    }

    /// Per-call response deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.worker.timeout_seconds)
    }

    /// Default restart cooldown.
    #[must_use]
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.worker.restart_cooldown_seconds)
    }

    /// Grace window before a forced kill.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.worker.kill_grace_ms)
    }

    /// Interval between dispatch cycles.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.poll_interval_seconds)
    }

    /// Staleness threshold, `None` when disabled.
    #[must_use]
    pub fn stale_after(&self) -> Option<Duration> {
        match self.dispatch.stale_after_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Worker environment overrides in a stable order.
    #[must_use]
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .worker
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env
    }

    fn validate(&self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            return Err(AppError::Config("worker.command must not be empty".into()));
        }

        if self.worker.timeout_seconds == 0 {
            return Err(AppError::Config(
                "worker.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.dispatch.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "dispatch.poll_interval_seconds must be greater than zero".into(),
            ));
        }

        SessionNaming::new(self.dispatch.session_prefix.as_str())?;
        self.project_table().validate()
    }
}
