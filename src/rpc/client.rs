//! Request/response client bound to one worker process.
//!
//! An [`RpcClient`] owns a single child process and exposes:
//!
//! - [`spawn`](RpcClient::spawn) — idempotent process start.
//! - [`send`](RpcClient::send) — write one command and await the response
//!   carrying the same `id`, bounded by a deadline.
//! - [`subscribe`](RpcClient::subscribe) — a broadcast stream of
//!   [`ClientEvent`]s for everything that is not a matched response.
//! - [`kill`](RpcClient::kill) — graceful stop with forced escalation.
//!
//! # Pending requests
//!
//! Every `send` registers a [`PendingRequest`] before the line is written.
//! Each entry is settled exactly once: by the reader task when the matching
//! response arrives, by the caller when its deadline passes, or by the exit
//! task, which rejects every outstanding entry with
//! [`AppError::WorkerExited`] the moment the process is reaped.
//!
//! The client never restarts its own process after an exit; recreating a
//! worker is the supervisor's decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde_json::Value;
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use crate::rpc::codec::RpcCodec;
use crate::rpc::message::{classify, InboundMessage, RpcCommand, RpcResponse, WorkerState};
use crate::rpc::process::{self, KillSignal, LaunchSpec, WorkerExit};
use crate::rpc::reader;
use crate::{AppError, Result};

/// Upper bound on the `abort` round trip, whatever the configured timeout.
pub const ABORT_TIMEOUT_CEILING: Duration = Duration::from_secs(5);

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait between `SIGTERM` and `SIGKILL`.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// How long to wait for the reap after a forced kill before giving up.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 256;

/// Construction parameters for an [`RpcClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Session this client serves; used in logs and error messages.
    pub session: String,
    /// How to start the worker.
    pub launch: LaunchSpec,
    /// Default deadline for [`RpcClient::send`].
    pub timeout: Duration,
    /// Grace window between graceful and forced termination.
    pub kill_grace: Duration,
}

impl ClientConfig {
    /// Config with default timeout and kill grace.
    #[must_use]
    pub fn new(session: impl Into<String>, launch: LaunchSpec) -> Self {
        Self {
            session: session.into(),
            launch,
            timeout: DEFAULT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Events broadcast by a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Any inbound message that did not settle a pending request.
    Message(InboundMessage),
    /// The worker asked for external input (`extension_ui_request`).
    NeedsInput(Value),
    /// Spawn or transport failure.
    Error(String),
    /// The worker process was reaped.
    Exited(WorkerExit),
}

/// An outstanding request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    /// Command name the request was sent with.
    pub expected_command: String,
    /// Instant after which the caller gives up.
    pub deadline: Instant,
    waiter: oneshot::Sender<Result<RpcResponse>>,
}

/// State shared between a client, its reader task and its exit task.
#[derive(Debug)]
pub struct ClientShared {
    session: String,
    pending: Mutex<HashMap<String, PendingRequest>>,
    events: broadcast::Sender<ClientEvent>,
    last_message: Mutex<Option<Instant>>,
    last_event: Mutex<Option<Instant>>,
}

impl ClientShared {
    fn new(session: String) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            pending: Mutex::new(HashMap::new()),
            events,
            last_message: Mutex::new(None),
            last_event: Mutex::new(None),
        }
    }

    /// Session name of the owning client.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    async fn emit_unsolicited(&self, message: InboundMessage) {
        *self.last_event.lock().await = Some(Instant::now());
        self.emit(ClientEvent::Message(message));
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is normal.
        let _ = self.events.send(event);
    }

    /// Route one decoded inbound value.
    ///
    /// A response whose id matches a pending request settles that request;
    /// everything else becomes a [`ClientEvent::Message`].
    pub async fn route(&self, value: Value) {
        *self.last_message.lock().await = Some(Instant::now());

        match classify(value) {
            InboundMessage::Response(response) => {
                let pending = self.pending.lock().await.remove(&response.id);
                match pending {
                    Some(request) => {
                        if request.expected_command != response.command {
                            warn!(
                                session = self.session,
                                id = response.id,
                                expected = request.expected_command,
                                actual = response.command,
                                "rpc: response command differs from request"
                            );
                        }
                        if request.waiter.send(Ok(response)).is_err() {
                            debug!(session = self.session, "rpc: caller dropped before response");
                        }
                    }
                    None => {
                        debug!(
                            session = self.session,
                            id = response.id,
                            "rpc: unmatched response, emitting as event"
                        );
                        self.emit_unsolicited(InboundMessage::Response(response)).await;
                    }
                }
            }
            InboundMessage::ExtensionUiRequest(payload) => {
                info!(session = self.session, "worker requested external input");
                self.emit_unsolicited(InboundMessage::ExtensionUiRequest(payload.clone()))
                    .await;
                self.emit(ClientEvent::NeedsInput(payload));
            }
            message @ InboundMessage::Event { .. } => self.emit_unsolicited(message).await,
        }
    }

    /// Reject every outstanding request and broadcast the exit.
    async fn handle_exit(&self, exit: WorkerExit) {
        let drained: Vec<(String, PendingRequest)> =
            self.pending.lock().await.drain().collect();

        if !drained.is_empty() {
            warn!(
                session = self.session,
                count = drained.len(),
                reason = %exit.reason,
                "worker exited with requests outstanding"
            );
        }

        for (id, request) in drained {
            let _ = request.waiter.send(Err(AppError::WorkerExited(format!(
                "session {} exited while awaiting response to {} (id {id}): {}",
                self.session, request.expected_command, exit.reason
            ))));
        }

        self.emit(ClientEvent::Exited(exit));
    }
}

/// Live process handles; replaced on respawn.
struct WorkerHandles {
    pid: Option<u32>,
    writer: FramedWrite<ChildStdin, RpcCodec>,
    kill_tx: mpsc::Sender<KillSignal>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandles {
    fn exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

/// Line-protocol client owning one worker process.
pub struct RpcClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    process: Mutex<Option<WorkerHandles>>,
    killed: AtomicBool,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("session", &self.config.session)
            .field("program", &self.config.launch.program)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Create a client; the worker is not started until [`spawn`](Self::spawn).
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let shared = Arc::new(ClientShared::new(config.session.clone()));
        Self {
            config,
            shared,
            process: Mutex::new(None),
            killed: AtomicBool::new(false),
        }
    }

    /// Session this client serves.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.config.session
    }

    /// Subscribe to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Started, not yet exited, and not killed.
    pub async fn is_alive(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return false;
        }
        self.process
            .lock()
            .await
            .as_ref()
            .is_some_and(|handles| !handles.exited())
    }

    /// OS pid of the current process, if started.
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|h| h.pid)
    }

    /// Instant of the most recent inbound line of any kind.
    pub async fn last_message_at(&self) -> Option<Instant> {
        *self.shared.last_message.lock().await
    }

    /// Instant of the most recent inbound line that did not settle a request.
    ///
    /// Responses to our own queries do not count, so this tracks whether the
    /// worker is making progress on its own.
    pub async fn last_event_at(&self) -> Option<Instant> {
        *self.shared.last_event.lock().await
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Start the worker unless one is already alive.
    ///
    /// Returns the pid of the live process, whether newly started or not.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] when the process cannot be started. The
    /// failure is also broadcast as [`ClientEvent::Error`].
    pub async fn spawn(&self) -> Result<Option<u32>> {
        let mut slot = self.process.lock().await;

        if let Some(handles) = slot.as_ref() {
            if !handles.exited() && !self.killed.load(Ordering::SeqCst) {
                debug!(session = self.config.session, "spawn: worker already alive");
                return Ok(handles.pid);
            }
        }

        let worker = match process::spawn_worker(&self.config.launch, &self.config.session) {
            Ok(worker) => worker,
            Err(err) => {
                warn!(session = self.config.session, %err, "worker spawn failed");
                self.shared.emit(ClientEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let (kill_tx, kill_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(reader::run_reader(worker.stdout, Arc::clone(&self.shared)));
        tokio::spawn(reader::drain_stderr(
            self.config.session.clone(),
            worker.stderr,
        ));

        let exit_shared = Arc::clone(&self.shared);
        let session = self.config.session.clone();
        tokio::spawn(async move {
            let exit = process::supervise(session, worker.child, kill_rx).await;
            // Publish before flushing so a concurrent `send` either sees the
            // exit or has its entry drained.
            let _ = exit_tx.send(Some(exit.clone()));
            exit_shared.handle_exit(exit).await;
        });

        *slot = Some(WorkerHandles {
            pid: worker.pid,
            writer: FramedWrite::new(worker.stdin, RpcCodec::new()),
            kill_tx,
            exit_rx,
        });
        self.killed.store(false, Ordering::SeqCst);

        Ok(worker.pid)
    }

    /// Send a raw command object and await its response.
    ///
    /// `command` must be a JSON object with a string `type`. A string `id` is
    /// generated when absent. `timeout` defaults to the configured value.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] — not an object, missing `type`, non-string or
    ///   duplicate `id`, worker not started, or the write failed.
    /// - [`AppError::Timeout`] — no matching response before the deadline;
    ///   the pending entry is removed.
    /// - [`AppError::WorkerExited`] — the process exited first.
    pub async fn send(&self, command: Value, timeout: Option<Duration>) -> Result<RpcResponse> {
        let Value::Object(mut fields) = command else {
            return Err(AppError::Rpc("command must be a JSON object".into()));
        };

        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Rpc("command is missing a string `type`".into()))?
            .to_owned();

        let id = match fields.get("id") {
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                fields.insert("id".into(), Value::String(id.clone()));
                id
            }
            Some(Value::String(id)) => id.clone(),
            Some(_) => return Err(AppError::Rpc("command `id` must be a string".into())),
        };

        let timeout = timeout.unwrap_or(self.config.timeout);
        let deadline = Instant::now() + timeout;
        let (waiter, rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock().await;
            if pending.contains_key(&id) {
                return Err(AppError::Rpc(format!(
                    "request id {id} is already outstanding"
                )));
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    expected_command: kind.clone(),
                    deadline,
                    waiter,
                },
            );
        }

        if let Err(err) = self.write(Value::Object(fields)).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(err);
        }

        debug!(session = self.config.session, id, command = kind, "rpc: request sent");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(AppError::WorkerExited(format!(
                "session {} dropped request {id} ({kind})",
                self.config.session
            ))),
            Err(_elapsed) => {
                self.shared.pending.lock().await.remove(&id);
                warn!(session = self.config.session, id, command = kind, ?timeout, "rpc: request timed out");
                Err(AppError::Timeout(format!(
                    "no response to {kind} (id {id}) from session {} within {timeout:?}",
                    self.config.session
                )))
            }
        }
    }

    /// Send a typed command.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn send_command(
        &self,
        command: &RpcCommand,
        timeout: Option<Duration>,
    ) -> Result<RpcResponse> {
        self.send(command.to_value()?, timeout).await
    }

    /// Ask the worker to start a fresh conversation.
    ///
    /// # Errors
    ///
    /// Transport errors from [`send`](Self::send), or [`AppError::Rpc`] when
    /// the worker reports failure.
    pub async fn new_session(&self, parent_session: Option<String>) -> Result<Option<Value>> {
        self.send_command(&RpcCommand::NewSession { parent_session }, None)
            .await?
            .into_data()
    }

    /// Query the worker's streaming and queue state.
    ///
    /// # Errors
    ///
    /// Transport errors, a reported failure, or a malformed state payload.
    pub async fn get_state(&self) -> Result<WorkerState> {
        let data = self
            .send_command(&RpcCommand::GetState, None)
            .await?
            .into_data()?;
        WorkerState::from_data(data)
    }

    /// Deliver a prompt.
    ///
    /// # Errors
    ///
    /// Transport errors, or [`AppError::Rpc`] when the worker rejects it.
    pub async fn prompt(&self, message: impl Into<String>) -> Result<()> {
        self.send_command(
            &RpcCommand::Prompt {
                message: message.into(),
            },
            None,
        )
        .await?
        .into_data()
        .map(|_| ())
    }

    /// Abort the current turn, waiting at most [`ABORT_TIMEOUT_CEILING`].
    ///
    /// # Errors
    ///
    /// Transport errors, or [`AppError::Rpc`] when the worker reports failure.
    pub async fn abort(&self) -> Result<()> {
        let timeout = self.config.timeout.min(ABORT_TIMEOUT_CEILING);
        self.send_command(&RpcCommand::Abort, Some(timeout))
            .await?
            .into_data()
            .map(|_| ())
    }

    /// Stop the worker: graceful signal first, forced kill after the grace
    /// window. Safe on a process that never started or already exited.
    ///
    /// Returns `true` once the process is known to be reaped.
    pub async fn kill(&self) -> bool {
        self.killed.store(true, Ordering::SeqCst);

        let (kill_tx, mut exit_rx, pid) = {
            let slot = self.process.lock().await;
            let Some(handles) = slot.as_ref() else {
                return true;
            };
            (handles.kill_tx.clone(), handles.exit_rx.clone(), handles.pid)
        };

        if exit_rx.borrow().is_some() {
            return true;
        }

        info!(session = self.config.session, pid = pid.unwrap_or(0), "stopping worker");
        let _ = kill_tx.send(KillSignal::Terminate).await;
        if wait_for_exit(&mut exit_rx, self.config.kill_grace).await {
            return true;
        }

        warn!(
            session = self.config.session,
            grace = ?self.config.kill_grace,
            "worker ignored termination, forcing kill"
        );
        let _ = kill_tx.send(KillSignal::Force).await;
        let reaped = wait_for_exit(&mut exit_rx, FORCE_KILL_WAIT).await;
        if !reaped {
            warn!(session = self.config.session, "worker not reaped after forced kill");
        }
        reaped
    }

    async fn write(&self, message: Value) -> Result<()> {
        let mut slot = self.process.lock().await;
        let Some(handles) = slot.as_mut() else {
            return Err(AppError::Rpc(format!(
                "worker for session {} is not running",
                self.config.session
            )));
        };

        if handles.exited() {
            return Err(AppError::WorkerExited(format!(
                "worker for session {} has already exited",
                self.config.session
            )));
        }

        handles.writer.send(message).await.map_err(|err| {
            warn!(session = self.config.session, %err, "rpc: write to worker stdin failed");
            self.shared
                .emit(ClientEvent::Error(format!("write failed: {err}")));
            AppError::Rpc(format!("write failed: {err}"))
        })
    }
}

async fn wait_for_exit(
    exit_rx: &mut watch::Receiver<Option<WorkerExit>>,
    within: Duration,
) -> bool {
    matches!(
        tokio::time::timeout(within, exit_rx.wait_for(Option::is_some)).await,
        Ok(Ok(_))
    )
}
