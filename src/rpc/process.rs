//! Worker process spawner and exit supervision.
//!
//! Spawns worker processes with:
//! - piped stdin/stdout/stderr for the line protocol and log capture,
//! - `kill_on_drop(true)` so a dropped client never leaks a process,
//! - the caller's environment inherited, plus per-launch overrides.
//!
//! [`supervise`] owns the [`Child`] for its whole life. It waits for exit and
//! applies [`KillSignal`]s sent by the client: `Terminate` asks politely
//! (`SIGTERM` on unix), `Force` kills outright.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Everything needed to start a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable name or path.
    pub program: String,
    /// Full argument list, including per-session overrides.
    pub args: Vec<String>,
    /// Working directory; `None` inherits the caller's.
    pub cwd: Option<PathBuf>,
    /// Environment overrides layered on the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Signals the client can ask the supervisor task to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Graceful termination request.
    Terminate,
    /// Immediate kill.
    Force,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

/// Handles of a freshly spawned worker.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// OS process id, if the platform reported one.
    pub pid: Option<u32>,
    /// Child handle; hand it to [`supervise`].
    pub child: Child,
    /// Outbound protocol stream.
    pub stdin: ChildStdin,
    /// Inbound protocol stream.
    pub stdout: ChildStdout,
    /// Diagnostic output.
    pub stderr: ChildStderr,
}

/// Spawn a worker process described by `launch`.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn …")` — OS spawn failure (missing
///   executable, bad working directory, permissions).
/// - `AppError::Spawn("failed to capture …")` — a stdio pipe was not created.
pub fn spawn_worker(launch: &LaunchSpec, session: &str) -> Result<SpawnedWorker> {
    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args);

    for (key, value) in &launch.env {
        cmd.env(key, value);
    }

    if let Some(ref cwd) = launch.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn {} for session {session}: {err}",
            launch.program
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stderr".into()))?;

    let pid = child.id();
    info!(
        session,
        pid = pid.unwrap_or(0),
        program = launch.program,
        cwd = ?launch.cwd,
        "worker process spawned"
    );

    Ok(SpawnedWorker {
        pid,
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Own `child` until it exits, delivering kill requests from `kill_rx`.
///
/// Returns once the process has been reaped. Closing `kill_rx` does not stop
/// supervision; the process is still awaited.
pub async fn supervise(
    session: String,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<KillSignal>,
) -> WorkerExit {
    let pid = child.id();

    loop {
        tokio::select! {
            result = child.wait() => {
                let exit = describe_exit(result);
                info!(session, pid = pid.unwrap_or(0), reason = %exit.reason, "worker process exited");
                return exit;
            }
            Some(signal) = kill_rx.recv() => {
                deliver(&session, &mut child, pid, signal);
            }
        }
    }
}

fn deliver(session: &str, child: &mut Child, pid: Option<u32>, signal: KillSignal) {
    match signal {
        KillSignal::Terminate => {
            debug!(session, "sending graceful termination to worker");
            if let Err(err) = terminate(child, pid) {
                warn!(session, %err, "graceful termination failed, forcing kill");
                force(session, child);
            }
        }
        KillSignal::Force => force(session, child),
    }
}

fn force(session: &str, child: &mut Child) {
    if let Err(err) = child.start_kill() {
        // InvalidInput means the child was already reaped.
        debug!(session, %err, "force kill not delivered");
    }
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return Ok(());
    };
    let raw = i32::try_from(pid).map_err(|_| AppError::Io(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(AppError::Io(format!("SIGTERM failed: {errno}"))),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) -> Result<()> {
    child.start_kill().map_err(AppError::from)
}

fn describe_exit(result: std::io::Result<ExitStatus>) -> WorkerExit {
    match result {
        Ok(status) => {
            let code = status.code();
            let reason = code.map_or_else(
                || "process terminated by signal".to_owned(),
                |c| format!("process exited with code {c}"),
            );
            WorkerExit { code, reason }
        }
        Err(err) => WorkerExit {
            code: None,
            reason: format!("wait error: {err}"),
        },
    }
}
