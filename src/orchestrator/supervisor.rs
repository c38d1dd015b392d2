//! Session supervisor: the single entry point for worker lifecycle.
//!
//! One [`SessionSupervisor`] owns every worker it starts. All methods take
//! `&mut self`, so calls are serialised by ownership and the registry and
//! cooldown maps need no lock. Operations return outcome enums rather than
//! errors wherever a dispatch loop is expected to carry on.
//!
//! Automated lifecycle actions (`ensure_session`, `abort_and_restart`) only
//! ever touch names inside the owned namespace; anything else is refused
//! before any side effect.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::session::{
    EnsureOutcome, IdleCheck, PromptOutcome, RestartOutcome, SessionContext, SessionNaming,
    SessionPhase, SessionSummary, ShutdownReport,
};
use crate::orchestrator::registry::{CooldownTracker, SessionEntry, SessionRegistry};
use crate::orchestrator::workdir::{self, DirectoryRequest, WorkDir};
use crate::rpc::client::{ClientConfig, RpcClient, DEFAULT_KILL_GRACE, DEFAULT_TIMEOUT};
use crate::rpc::message::WorkerState;
use crate::rpc::process::LaunchSpec;
use crate::{AppError, Result};

/// Supervisor-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Worker executable.
    pub program: String,
    /// Arguments passed to every worker before per-session flags.
    pub base_args: Vec<String>,
    /// Environment overrides for every worker.
    pub env: Vec<(String, String)>,
    /// Default per-call timeout.
    pub timeout: Duration,
    /// Default restart cooldown.
    pub restart_cooldown: Duration,
    /// Grace window before a forced kill.
    pub kill_grace: Duration,
    /// Ownership prefix.
    pub session_prefix: String,
    /// Shared root for directory fallbacks.
    pub workspace_root: Option<PathBuf>,
    /// Strict directory policy.
    pub strict_directories: bool,
    /// Project id or name to working directory.
    pub directory_overrides: HashMap<String, String>,
}

impl SupervisorConfig {
    /// Defaults for `program`: 30 s timeout, 300 s cooldown, `dispatch_` prefix.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            restart_cooldown: Duration::from_secs(300),
            kill_grace: DEFAULT_KILL_GRACE,
            session_prefix: "dispatch_".into(),
            workspace_root: None,
            strict_directories: false,
            directory_overrides: HashMap::new(),
        }
    }

    /// Settings drawn from a loaded configuration file.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            program: config.worker.command.clone(),
            base_args: config.worker.args.clone(),
            env: config.worker_env(),
            timeout: config.timeout(),
            restart_cooldown: config.restart_cooldown(),
            kill_grace: config.kill_grace(),
            session_prefix: config.dispatch.session_prefix.clone(),
            workspace_root: config.dispatch.workspace_root.clone(),
            strict_directories: config.dispatch.strict_directories,
            directory_overrides: config.directory_overrides.clone(),
        }
    }
}

/// Owner of all supervised workers.
#[derive(Debug)]
pub struct SessionSupervisor {
    config: SupervisorConfig,
    naming: SessionNaming,
    registry: SessionRegistry,
    cooldowns: CooldownTracker,
    next_generation: u64,
}

impl SessionSupervisor {
    /// Build a supervisor with no sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the session prefix is invalid.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let naming = SessionNaming::new(config.session_prefix.as_str())?;
        let cooldowns = CooldownTracker::new(config.restart_cooldown);
        Ok(Self {
            config,
            naming,
            registry: SessionRegistry::new(),
            cooldowns,
            next_generation: 0,
        })
    }

    /// Whether `name` is inside the owned namespace.
    #[must_use]
    pub fn is_owned(&self, name: &str) -> bool {
        self.naming.is_owned(name)
    }

    /// Owned session name for a project id.
    #[must_use]
    pub fn session_name_for(&self, project_id: &str) -> Option<String> {
        self.naming.name_for(project_id)
    }

    /// Replace the directory override table, e.g. after a config reload.
    pub fn set_directory_overrides(&mut self, overrides: HashMap<String, String>) {
        self.config.directory_overrides = overrides;
    }

    /// Restart bookkeeping.
    #[must_use]
    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    /// Make sure a live worker with an open conversation exists for `name`.
    pub async fn ensure_session(&mut self, name: &str, context: &SessionContext) -> EnsureOutcome {
        let span = info_span!("ensure_session", session = name, project = %context.project_id);
        self.ensure_inner(name, context).instrument(span).await
    }

    async fn ensure_inner(&mut self, name: &str, context: &SessionContext) -> EnsureOutcome {
        if let Err(err) = self.naming.ensure_owned(name) {
            warn!(%err, "refusing to manage session");
            return EnsureOutcome::Refused {
                reason: err.to_string(),
            };
        }

        if let Some(entry) = self.registry.get(name) {
            if entry.client.is_alive().await {
                return EnsureOutcome::Existed;
            }
            info!("dropping dead session before recreation");
            self.registry.remove(name);
        }

        let remaining = self
            .cooldowns
            .cooldown_remaining(name, context.restart_cooldown);
        if !remaining.is_zero() {
            info!(remaining_secs = remaining.as_secs(), "skipped, restart cooldown active");
            return EnsureOutcome::Skipped {
                remaining,
                reason: format!(
                    "skipped, {}s cooldown remaining",
                    remaining.as_secs().max(1)
                ),
            };
        }

        let request = DirectoryRequest {
            project_id: &context.project_id,
            project_name: &context.project_name,
            explicit: context.repo_path.as_deref(),
            overrides: &self.config.directory_overrides,
            root: self.config.workspace_root.as_deref(),
            strict: self.config.strict_directories,
        };
        let workdir = match workdir::resolve(&request) {
            Ok(workdir) => workdir,
            Err(err) => {
                warn!(%err, "working directory unresolved, skipping");
                self.cooldowns.record_restart_attempt(name);
                return EnsureOutcome::Skipped {
                    remaining: context
                        .restart_cooldown
                        .unwrap_or(self.cooldowns.default_cooldown()),
                    reason: err.to_string(),
                };
            }
        };

        let client = RpcClient::new(ClientConfig {
            session: name.to_owned(),
            launch: self.launch_spec(context, &workdir),
            timeout: context.timeout.unwrap_or(self.config.timeout),
            kill_grace: self.config.kill_grace,
        });

        let pid = match client.spawn().await {
            Ok(pid) => pid,
            Err(err) => {
                self.cooldowns.record_restart_attempt(name);
                return EnsureOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        self.next_generation += 1;
        let mut entry = SessionEntry::new(
            name.to_owned(),
            client,
            workdir.clone(),
            self.next_generation,
        );

        if let Err(err) = entry.client.new_session(context.parent_session.clone()).await {
            warn!(%err, "new_session failed, stopping worker");
            self.cooldowns.record_restart_attempt(name);
            entry.set_phase(SessionPhase::Aborting);
            entry.client.kill().await;
            return EnsureOutcome::Failed {
                reason: err.to_string(),
            };
        }

        entry.set_phase(SessionPhase::Ready);
        self.registry.insert(entry);
        info!(pid = pid.unwrap_or(0), workdir = ?workdir.path(), "session created");
        EnsureOutcome::Created { pid, workdir }
    }

    /// Query a registered worker's state.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if no session is registered under `name`.
    /// - `AppError::WorkerExited` if the worker is no longer alive.
    /// - Any error from the `get_state` round trip.
    pub async fn get_state(&mut self, name: &str) -> Result<WorkerState> {
        let entry = self
            .registry
            .get_mut(name)
            .ok_or_else(|| AppError::NotFound(format!("session {name} is not registered")))?;

        if !entry.client.is_alive().await {
            return Err(AppError::WorkerExited(format!(
                "worker for session {name} is not running"
            )));
        }

        let state = entry.client.get_state().await?;
        entry.set_phase(if state.is_idle() {
            SessionPhase::Idle
        } else {
            SessionPhase::Busy
        });
        Ok(state)
    }

    /// Classify `name` as idle, busy, not running, or unknown.
    ///
    /// A failed state query is `Unknown`, never `Busy`.
    pub async fn is_idle(&mut self, name: &str) -> IdleCheck {
        match self.get_state(name).await {
            Ok(state) if state.is_idle() => IdleCheck::Idle(state),
            Ok(state) => IdleCheck::Busy(state),
            Err(AppError::NotFound(_) | AppError::WorkerExited(_)) => IdleCheck::NotRunning,
            Err(err) => IdleCheck::Unknown {
                timed_out: err.is_timeout(),
                reason: err.to_string(),
            },
        }
    }

    /// Deliver `prompt` only if the worker is idle right now. Never queues.
    pub async fn prompt_if_idle(&mut self, name: &str, prompt: &str) -> PromptOutcome {
        let span = info_span!("prompt_if_idle", session = name);
        async {
            match self.is_idle(name).await {
                IdleCheck::Idle(_) => {}
                IdleCheck::Busy(state) => return PromptOutcome::NotIdle(state),
                IdleCheck::NotRunning => return PromptOutcome::NotRunning,
                IdleCheck::Unknown { reason, timed_out } => {
                    return PromptOutcome::Unknown { reason, timed_out }
                }
            }

            let Some(entry) = self.registry.get_mut(name) else {
                return PromptOutcome::NotRunning;
            };

            match entry.client.prompt(prompt).await {
                Ok(()) => {
                    entry.clear_needs_input();
                    entry.set_phase(SessionPhase::Busy);
                    info!(chars = prompt.len(), "prompt dispatched");
                    PromptOutcome::Prompted
                }
                Err(err) => {
                    warn!(%err, "prompt rejected");
                    PromptOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Tear down `name` and start its cooldown.
    ///
    /// The cooldown is recorded first, even if no worker is running. Abort is
    /// best effort; the process is always killed.
    pub async fn abort_and_restart(&mut self, name: &str, reason: &str) -> RestartOutcome {
        let span = info_span!("abort_and_restart", session = name, reason);
        async {
            if let Err(err) = self.naming.ensure_owned(name) {
                warn!(%err, "refusing to restart session");
                return RestartOutcome::Refused {
                    reason: err.to_string(),
                };
            }

            self.cooldowns.record_restart_attempt(name);

            let Some(mut entry) = self.registry.remove(name) else {
                info!("no live session, cooldown recorded");
                return RestartOutcome::NotRunning;
            };

            entry.set_phase(SessionPhase::Aborting);
            let stop = stop_entry(&entry).await;
            entry.set_phase(SessionPhase::Absent);

            info!(aborted = stop.aborted, killed = stop.killed, "session stopped for restart");
            RestartOutcome::Stopped {
                aborted: stop.aborted,
                killed: stop.killed,
            }
        }
        .instrument(span)
        .await
    }

    /// Stop every session. Never short-circuits; one report per session.
    pub async fn shutdown(&mut self, reason: &str) -> Vec<ShutdownReport> {
        let span = info_span!("shutdown", reason, sessions = self.registry.len());
        async {
            let mut entries = self.registry.drain();
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            let mut reports = Vec::with_capacity(entries.len());
            for mut entry in entries {
                entry.set_phase(SessionPhase::Aborting);
                let stop = stop_entry(&entry).await;
                entry.set_phase(SessionPhase::Absent);
                reports.push(ShutdownReport {
                    name: entry.name.clone(),
                    aborted: stop.aborted,
                    killed: stop.killed,
                    error: stop.error,
                });
            }

            info!(stopped = reports.len(), "supervisor shut down");
            reports
        }
        .instrument(span)
        .await
    }

    /// Snapshot of every registered session, sorted by name.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::with_capacity(self.registry.len());
        for name in self.registry.names() {
            if let Some(entry) = self.registry.get(&name) {
                summaries.push(entry.summary().await);
            }
        }
        summaries
    }

    /// Time since the worker last sent anything unprompted, measured from
    /// spawn if it never has.
    pub async fn event_silence(&self, name: &str) -> Option<Duration> {
        let entry = self.registry.get(name)?;
        let since = entry
            .client
            .last_event_at()
            .await
            .unwrap_or(entry.spawned_at);
        Some(since.elapsed())
    }

    /// Incarnation number of the live session, if any.
    #[must_use]
    pub fn generation(&self, name: &str) -> Option<u64> {
        self.registry.get(name).map(|entry| entry.generation)
    }

    /// Whether the session is waiting for external input.
    #[must_use]
    pub fn needs_input(&self, name: &str) -> bool {
        self.registry.get(name).is_some_and(SessionEntry::needs_input)
    }

    fn launch_spec(&self, context: &SessionContext, workdir: &WorkDir) -> LaunchSpec {
        let mut args = self.config.base_args.clone();
        if let Some(provider) = &context.provider {
            args.push("--provider".into());
            args.push(provider.clone());
        }
        if let Some(model) = &context.model {
            args.push("--model".into());
            args.push(model.clone());
        }

        LaunchSpec {
            program: self.config.program.clone(),
            args,
            cwd: workdir.path().map(std::path::Path::to_path_buf),
            env: self.config.env.clone(),
        }
    }
}

struct StopResult {
    aborted: bool,
    killed: bool,
    error: Option<String>,
}

/// Best-effort abort followed by a kill.
async fn stop_entry(entry: &SessionEntry) -> StopResult {
    let mut error = None;
    let aborted = if entry.client.is_alive().await {
        match entry.client.abort().await {
            Ok(()) => true,
            Err(err) => {
                warn!(session = entry.name, %err, "abort failed, killing anyway");
                error = Some(err.to_string());
                false
            }
        }
    } else {
        false
    };

    let killed = entry.client.kill().await;
    StopResult {
        aborted,
        killed,
        error,
    }
}
