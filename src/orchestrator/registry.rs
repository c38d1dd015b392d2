//! In-memory session registry and restart cooldown tracking.
//!
//! The registry maps session names to live [`SessionEntry`]s; at most one
//! entry exists per name. The [`CooldownTracker`] remembers when each name
//! last had a restart attempt so repeated failures cannot thrash.
//!
//! Neither type synchronises internally; both are owned by the supervisor,
//! which serialises all mutation through `&mut self`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};

use crate::models::session::{SessionPhase, SessionSummary};
use crate::orchestrator::workdir::WorkDir;
use crate::rpc::client::{ClientEvent, RpcClient};

/// One supervised worker.
#[derive(Debug)]
pub struct SessionEntry {
    /// Session name; the registry key.
    pub name: String,
    /// Client owning the worker process.
    pub client: RpcClient,
    /// Wall-clock creation time, for reporting.
    pub started_at: DateTime<Utc>,
    /// Monotonic creation time, the staleness baseline before any event.
    pub spawned_at: Instant,
    /// Resolved working directory.
    pub workdir: WorkDir,
    /// Last observed lifecycle phase.
    pub phase: SessionPhase,
    /// Incarnation number; a recreated session gets a new one.
    pub generation: u64,
    needs_input: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl SessionEntry {
    /// Wrap a spawned client and start listening for input requests.
    #[must_use]
    pub fn new(name: String, client: RpcClient, workdir: WorkDir, generation: u64) -> Self {
        let needs_input = Arc::new(AtomicBool::new(false));
        let listener = tokio::spawn(
            watch_input_requests(client.subscribe(), Arc::clone(&needs_input))
                .instrument(info_span!("input_listener", session = %name)),
        );

        Self {
            name,
            client,
            started_at: Utc::now(),
            spawned_at: Instant::now(),
            workdir,
            phase: SessionPhase::Starting,
            generation,
            needs_input,
            listener,
        }
    }

    /// The worker asked for external input since the flag was last cleared.
    #[must_use]
    pub fn needs_input(&self) -> bool {
        self.needs_input.load(Ordering::SeqCst)
    }

    /// Forget a previous input request, typically after a new prompt.
    pub fn clear_needs_input(&self) {
        self.needs_input.store(false, Ordering::SeqCst);
    }

    /// Move to `next`, logging transitions the lifecycle does not expect.
    pub fn set_phase(&mut self, next: SessionPhase) {
        if self.phase != next && !self.phase.can_transition_to(next) {
            debug!(
                session = self.name,
                from = ?self.phase,
                to = ?next,
                "unexpected session phase transition"
            );
        }
        self.phase = next;
    }

    /// Point-in-time summary.
    pub async fn summary(&self) -> SessionSummary {
        SessionSummary {
            name: self.name.clone(),
            pid: self.client.pid().await,
            workdir: self.workdir.path().map(std::path::Path::to_path_buf),
            started_at: self.started_at,
            phase: self.phase,
            needs_input: self.needs_input(),
            alive: self.client.is_alive().await,
        }
    }
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn watch_input_requests(
    mut events: tokio::sync::broadcast::Receiver<ClientEvent>,
    flag: Arc<AtomicBool>,
) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::NeedsInput(_)) => {
                info!("worker is waiting for external input");
                flag.store(true, Ordering::SeqCst);
            }
            Ok(ClientEvent::Exited(_)) | Err(RecvError::Closed) => return,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "input listener lagged behind worker events");
            }
        }
    }
}

/// Name-keyed session table.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<String, SessionEntry>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, returning any entry it replaced.
    pub fn insert(&mut self, entry: SessionEntry) -> Option<SessionEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SessionEntry> {
        self.entries.get(name)
    }

    /// Look up a session mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SessionEntry> {
        self.entries.get_mut(name)
    }

    /// Remove a session.
    pub fn remove(&mut self, name: &str) -> Option<SessionEntry> {
        self.entries.remove(name)
    }

    /// Remove and return every session.
    pub fn drain(&mut self) -> Vec<SessionEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No sessions registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Last restart attempt per session name.
///
/// Uses the tokio clock so paused-time tests can advance it.
#[derive(Debug, Clone)]
pub struct CooldownTracker {
    default: Duration,
    attempts: HashMap<String, Instant>,
}

impl CooldownTracker {
    /// Tracker applying `default` when no per-call cooldown is given.
    #[must_use]
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            attempts: HashMap::new(),
        }
    }

    /// Default cooldown.
    #[must_use]
    pub fn default_cooldown(&self) -> Duration {
        self.default
    }

    /// Record a restart attempt for `name` now.
    pub fn record_restart_attempt(&mut self, name: &str) {
        self.attempts.insert(name.to_owned(), Instant::now());
    }

    /// When the last attempt was recorded.
    #[must_use]
    pub fn last_attempt(&self, name: &str) -> Option<Instant> {
        self.attempts.get(name).copied()
    }

    /// Time left before `name` may be recreated; zero when free.
    ///
    /// `cooldown` overrides the default for this query.
    #[must_use]
    pub fn cooldown_remaining(&self, name: &str, cooldown: Option<Duration>) -> Duration {
        let cooldown = cooldown.unwrap_or(self.default);
        self.attempts.get(name).map_or(Duration::ZERO, |at| {
            cooldown.saturating_sub(at.elapsed())
        })
    }

    /// Whether `name` is still cooling down.
    #[must_use]
    pub fn is_within_cooldown(&self, name: &str, cooldown: Option<Duration>) -> bool {
        !self.cooldown_remaining(name, cooldown).is_zero()
    }
}
