//! Session naming, lifecycle phases and supervisor outcomes.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::orchestrator::workdir::WorkDir;
use crate::rpc::message::WorkerState;
use crate::{AppError, Result};

/// Characters allowed after the ownership prefix.
const OWNED_SUFFIX_PATTERN: &str = "^[A-Za-z0-9-]+$";

/// Lifecycle phase of a supervised session.
///
/// `Absent → Starting → Ready → (Busy ⇄ Idle) → Aborting → Absent`
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No worker.
    Absent,
    /// Worker spawned, `new_session` in flight.
    Starting,
    /// `new_session` acknowledged; no state observed yet.
    Ready,
    /// Last observation: streaming or messages queued.
    Busy,
    /// Last observation: safe to receive work.
    Idle,
    /// Abort and kill in progress.
    Aborting,
}

impl SessionPhase {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        matches!(
            (self, next),
            (SessionPhase::Absent, SessionPhase::Starting)
                | (
                    SessionPhase::Starting,
                    SessionPhase::Ready | SessionPhase::Aborting
                )
                | (
                    SessionPhase::Ready | SessionPhase::Busy | SessionPhase::Idle,
                    SessionPhase::Busy | SessionPhase::Idle | SessionPhase::Aborting
                )
                | (SessionPhase::Aborting, SessionPhase::Absent)
        )
    }
}

/// Ownership rules for session names: a fixed prefix followed by one or more
/// `[A-Za-z0-9-]` characters.
///
/// Only owned names are eligible for automated lifecycle actions.
#[derive(Debug, Clone)]
pub struct SessionNaming {
    prefix: String,
    suffix: Regex,
}

impl SessionNaming {
    /// Build naming rules for `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the prefix is empty or contains
    /// whitespace.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(AppError::Config("session_prefix must not be empty".into()));
        }
        if prefix.chars().any(char::is_whitespace) {
            return Err(AppError::Config(format!(
                "session_prefix '{prefix}' must not contain whitespace"
            )));
        }
        let suffix = Regex::new(OWNED_SUFFIX_PATTERN)
            .map_err(|err| AppError::Config(format!("invalid ownership pattern: {err}")))?;
        Ok(Self { prefix, suffix })
    }

    /// Whether `name` is a session this supervisor owns.
    #[must_use]
    pub fn is_owned(&self, name: &str) -> bool {
        name.strip_prefix(&self.prefix)
            .is_some_and(|rest| self.suffix.is_match(rest))
    }

    /// Refuse names outside the owned namespace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` naming the expected prefix.
    pub fn ensure_owned(&self, name: &str) -> Result<()> {
        if self.is_owned(name) {
            Ok(())
        } else {
            Err(AppError::Unauthorized(format!(
                "session '{name}' is not owned by this supervisor (expected '{}' followed by [A-Za-z0-9-])",
                self.prefix
            )))
        }
    }

    /// Derive the owned session name for a project id.
    ///
    /// ASCII letters and digits are kept, `-` is doubled and every other
    /// character becomes `-<hex code point>-`, so distinct ids never share a
    /// name. Returns `None` for an empty id.
    #[must_use]
    pub fn name_for(&self, project_id: &str) -> Option<String> {
        if project_id.is_empty() {
            return None;
        }
        let mut name = self.prefix.clone();
        for c in project_id.chars() {
            match c {
                c if c.is_ascii_alphanumeric() => name.push(c),
                '-' => name.push_str("--"),
                c => {
                    let _ = write!(name, "-{:x}-", u32::from(c));
                }
            }
        }
        Some(name)
    }
}

/// Per-session launch context supplied by the dispatch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// External project identifier.
    pub project_id: String,
    /// Human-readable project name.
    pub project_name: String,
    /// Explicit working directory; highest precedence.
    pub repo_path: Option<String>,
    /// `--provider` override.
    pub provider: Option<String>,
    /// `--model` override.
    pub model: Option<String>,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
    /// Restart cooldown override.
    pub restart_cooldown: Option<Duration>,
    /// Branch the worker conversation from this session.
    pub parent_session: Option<String>,
}

/// Result of [`ensure_session`](crate::orchestrator::supervisor::SessionSupervisor::ensure_session).
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    /// A new worker was started and acknowledged `new_session`.
    Created {
        /// OS pid of the worker.
        pid: Option<u32>,
        /// Where the worker runs.
        workdir: WorkDir,
    },
    /// A live worker already existed.
    Existed,
    /// Creation refused without spawning.
    Skipped {
        /// Cooldown left before the next attempt.
        remaining: Duration,
        /// Why creation was skipped.
        reason: String,
    },
    /// Spawn or `new_session` failed; a restart attempt was recorded.
    Failed {
        /// Failure description.
        reason: String,
    },
    /// The name is outside the owned namespace.
    Refused {
        /// Ownership violation description.
        reason: String,
    },
}

impl EnsureOutcome {
    /// A worker is available after this outcome.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Existed)
    }

    /// Human-readable reason for non-ready outcomes.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Skipped { reason, .. } | Self::Failed { reason } | Self::Refused { reason } => {
                Some(reason)
            }
            Self::Created { .. } | Self::Existed => None,
        }
    }
}

/// Result of an idle check.
#[derive(Debug, Clone, PartialEq)]
pub enum IdleCheck {
    /// Safe to prompt.
    Idle(WorkerState),
    /// Known and busy.
    Busy(WorkerState),
    /// No live worker.
    NotRunning,
    /// The state query failed; idleness is unknown.
    Unknown {
        /// Failure description.
        reason: String,
        /// The query hit its deadline.
        timed_out: bool,
    },
}

/// Result of [`prompt_if_idle`](crate::orchestrator::supervisor::SessionSupervisor::prompt_if_idle).
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    /// The prompt was accepted by an idle worker.
    Prompted,
    /// Not sent; the worker is busy.
    NotIdle(WorkerState),
    /// Not sent; no live worker.
    NotRunning,
    /// Not sent; state could not be determined.
    Unknown {
        /// Failure description.
        reason: String,
        /// The state query hit its deadline.
        timed_out: bool,
    },
    /// The worker was idle but the prompt itself failed.
    Failed {
        /// Failure description.
        reason: String,
    },
}

impl PromptOutcome {
    /// Whether a prompt was delivered.
    #[must_use]
    pub fn prompted(&self) -> bool {
        matches!(self, Self::Prompted)
    }
}

/// Result of [`abort_and_restart`](crate::orchestrator::supervisor::SessionSupervisor::abort_and_restart).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The worker was torn down; recreation waits for the cooldown.
    Stopped {
        /// The `abort` command was acknowledged.
        aborted: bool,
        /// The process is confirmed reaped.
        killed: bool,
    },
    /// No live session; the cooldown was still recorded.
    NotRunning,
    /// Ownership violation; nothing was touched.
    Refused {
        /// Ownership violation description.
        reason: String,
    },
}

/// Per-session result of a bulk shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Session name.
    pub name: String,
    /// `abort` was acknowledged.
    pub aborted: bool,
    /// The process is confirmed reaped.
    pub killed: bool,
    /// Abort failure, if any.
    pub error: Option<String>,
}

/// Snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Session name.
    pub name: String,
    /// Worker pid.
    pub pid: Option<u32>,
    /// Working directory, `None` when inherited.
    pub workdir: Option<PathBuf>,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
    /// Last observed lifecycle phase.
    pub phase: SessionPhase,
    /// The worker has asked for external input since the last prompt.
    pub needs_input: bool,
    /// Worker process is still alive.
    pub alive: bool,
}
