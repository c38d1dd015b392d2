//! Dispatch loop: feeds work items to per-project workers.
//!
//! Each cycle pulls the current work list from a [`WorkSource`], and for
//! every enabled project makes sure its worker exists, checks the worker's
//! health, and delivers the prompt only when the worker is idle. At most one
//! item per project is considered per cycle; later duplicates wait for the
//! next one.
//!
//! Health rules:
//! - a `get_state` that times out means the worker is wedged: restart it;
//! - a busy worker that has sent nothing unprompted for the stale threshold
//!   is considered hung: restart it.
//!
//! Restarts go through the supervisor's cooldown, so a worker that keeps
//! failing is retried at most once per cooldown window.

pub mod file_source;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{GlobalConfig, ProjectTable};
use crate::models::session::{
    EnsureOutcome, IdleCheck, PromptOutcome, RestartOutcome, SessionContext, ShutdownReport,
};
use crate::models::work::WorkItem;
use crate::orchestrator::supervisor::SessionSupervisor;
use crate::Result;

/// Producer of work items, polled once per cycle.
pub trait WorkSource: Send + Sync {
    /// Current work list.
    ///
    /// # Errors
    ///
    /// Implementation-specific; a failed fetch skips the cycle.
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>>;
}

/// Loop timing and health thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Time between cycles.
    pub poll_interval: Duration,
    /// Busy workers silent this long are restarted; `None` disables.
    pub stale_after: Option<Duration>,
}

impl DispatchSettings {
    /// Settings drawn from a loaded configuration file.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            stale_after: config.stale_after(),
        }
    }
}

/// What happened to one work item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The prompt was delivered.
    Prompted,
    /// The project is disabled in configuration.
    Disabled,
    /// The project id yields no usable session name.
    InvalidName,
    /// Another item for the same project was handled this cycle.
    Deferred,
    /// The worker could not be made available.
    NotReady(EnsureOutcome),
    /// This worker incarnation already received this prompt.
    AlreadyDelivered,
    /// The worker is busy.
    Busy,
    /// The worker was torn down; it will be recreated after its cooldown.
    Restarted {
        /// Why the restart was triggered.
        reason: String,
    },
    /// The worker vanished between ensure and prompt.
    NotRunning,
    /// Idleness could not be determined.
    Unknown {
        /// Failure description.
        reason: String,
    },
    /// The prompt was rejected.
    Failed {
        /// Failure description.
        reason: String,
    },
}

/// Per-cycle results, in work-list order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// `(project id, outcome)` for every item fetched.
    pub items: Vec<(String, ItemOutcome)>,
}

impl CycleReport {
    /// Number of prompts delivered.
    #[must_use]
    pub fn prompted(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Prompted))
    }

    /// Number of workers restarted.
    #[must_use]
    pub fn restarted(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Restarted { .. }))
    }

    /// Outcome for a project id, if it appeared in the cycle.
    #[must_use]
    pub fn outcome_for(&self, project_id: &str) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|(id, _)| id == project_id)
            .map(|(_, outcome)| outcome)
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Drives a [`SessionSupervisor`] from a [`WorkSource`].
pub struct DispatchLoop {
    supervisor: SessionSupervisor,
    source: Box<dyn WorkSource>,
    projects: Arc<RwLock<ProjectTable>>,
    settings: DispatchSettings,
    delivered: HashMap<String, (u64, String)>,
}

impl std::fmt::Debug for DispatchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchLoop")
            .field("supervisor", &self.supervisor)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DispatchLoop {
    /// Assemble a loop; `projects` may be shared with a config watcher.
    #[must_use]
    pub fn new(
        supervisor: SessionSupervisor,
        source: Box<dyn WorkSource>,
        projects: Arc<RwLock<ProjectTable>>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            supervisor,
            source,
            projects,
            settings,
            delivered: HashMap::new(),
        }
    }

    /// Supervisor driven by this loop.
    #[must_use]
    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// Mutable access to the supervisor.
    pub fn supervisor_mut(&mut self) -> &mut SessionSupervisor {
        &mut self.supervisor
    }

    /// Run one fetch-and-dispatch pass.
    ///
    /// # Errors
    ///
    /// Only a failed fetch is an error; per-item problems are reported in the
    /// returned [`CycleReport`].
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let items = self.source.fetch().await?;
        let table = self
            .projects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        self.supervisor
            .set_directory_overrides(table.directory_overrides.clone());

        let mut report = CycleReport::default();
        let mut seen = HashSet::new();

        for item in items {
            let outcome = if seen.insert(item.project_id.clone()) {
                let span = info_span!("dispatch_item", project = %item.project_id);
                self.dispatch_item(&item, &table).instrument(span).await
            } else {
                debug!(project = item.project_id, "deferring extra item for project");
                ItemOutcome::Deferred
            };
            report.items.push((item.project_id, outcome));
        }

        info!(
            items = report.items.len(),
            prompted = report.prompted(),
            restarted = report.restarted(),
            "dispatch cycle complete"
        );
        Ok(report)
    }

    async fn dispatch_item(&mut self, item: &WorkItem, table: &ProjectTable) -> ItemOutcome {
        let settings = table.lookup(&item.project_id, &item.project_name);
        if settings.is_some_and(|p| !p.enabled) {
            debug!("project disabled");
            return ItemOutcome::Disabled;
        }

        let Some(name) = self.supervisor.session_name_for(&item.project_id) else {
            warn!("project id yields no usable session name");
            return ItemOutcome::InvalidName;
        };

        let mut context = SessionContext {
            project_id: item.project_id.clone(),
            project_name: item.project_name.clone(),
            ..SessionContext::default()
        };
        if let Some(settings) = settings {
            settings.apply_to(&mut context);
        }

        let ensured = self.supervisor.ensure_session(&name, &context).await;
        if !ensured.is_ready() {
            debug!(reason = ensured.reason().unwrap_or_default(), "worker not ready");
            return ItemOutcome::NotReady(ensured);
        }

        let generation = self.supervisor.generation(&name).unwrap_or_default();
        let already = self
            .delivered
            .get(&name)
            .is_some_and(|(gen, prompt)| *gen == generation && *prompt == item.prompt);

        if already {
            return match self.supervisor.is_idle(&name).await {
                IdleCheck::Idle(_) => ItemOutcome::AlreadyDelivered,
                IdleCheck::Busy(_) => self.check_stale(&name).await,
                IdleCheck::NotRunning => ItemOutcome::NotRunning,
                IdleCheck::Unknown { reason, timed_out } => {
                    self.on_unknown(&name, reason, timed_out).await
                }
            };
        }

        match self.supervisor.prompt_if_idle(&name, &item.prompt).await {
            PromptOutcome::Prompted => {
                self.delivered
                    .insert(name, (generation, item.prompt.clone()));
                ItemOutcome::Prompted
            }
            PromptOutcome::NotIdle(_) => self.check_stale(&name).await,
            PromptOutcome::NotRunning => ItemOutcome::NotRunning,
            PromptOutcome::Unknown { reason, timed_out } => {
                self.on_unknown(&name, reason, timed_out).await
            }
            PromptOutcome::Failed { reason } => ItemOutcome::Failed { reason },
        }
    }

    async fn check_stale(&mut self, name: &str) -> ItemOutcome {
        let Some(threshold) = self.settings.stale_after else {
            return ItemOutcome::Busy;
        };
        let Some(silence) = self.supervisor.event_silence(name).await else {
            return ItemOutcome::Busy;
        };
        if silence < threshold {
            return ItemOutcome::Busy;
        }

        let reason = format!("busy with no worker activity for {}s", silence.as_secs());
        self.restart(name, reason).await
    }

    async fn on_unknown(&mut self, name: &str, reason: String, timed_out: bool) -> ItemOutcome {
        if timed_out {
            return self.restart(name, format!("state query timed out: {reason}")).await;
        }
        ItemOutcome::Unknown { reason }
    }

    async fn restart(&mut self, name: &str, reason: String) -> ItemOutcome {
        warn!(session = name, reason = %reason, "restarting worker");
        self.delivered.remove(name);
        match self.supervisor.abort_and_restart(name, &reason).await {
            RestartOutcome::Refused { reason } => ItemOutcome::Failed { reason },
            RestartOutcome::Stopped { .. } | RestartOutcome::NotRunning => {
                ItemOutcome::Restarted { reason }
            }
        }
    }

    /// Cycle every poll interval until `cancel` fires, then shut every
    /// worker down.
    pub async fn run(mut self, cancel: CancellationToken) -> Vec<ShutdownReport> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.settings.poll_interval, "dispatch loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_cycle().await {
                        warn!(%err, "dispatch cycle failed, retrying next interval");
                    }
                }
            }
        }

        self.supervisor.shutdown("dispatch loop stopped").await
    }
}
