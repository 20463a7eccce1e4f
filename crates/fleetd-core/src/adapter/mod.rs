//! Platform adapter.
//!
//! OS-specific primitives for spawning, liveness-polling, and terminating
//! child processes. Handles are opaque and are closed exactly once: either
//! a successful exit poll or `terminate` reaps the child, so no zombies are
//! left behind on POSIX.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::process::ProcessConfig;

/// Grace period between the graceful-shutdown signal and the hard kill.
pub const GRACE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the child's standard streams are wired at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnIo {
    /// Stdin closed; stdout/stderr inherit the supervisor's console.
    Inherit,
    /// All three streams piped back to the supervisor, for attachment to a
    /// stdio channel. Child-side pipe ends are inherited by the child;
    /// parent-side ends are not.
    Piped,
}

/// Opaque handle to a spawned child process.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
}

/// A freshly spawned child with its parent-side pipe ends.
pub struct SpawnedChild {
    /// Opaque process handle.
    pub handle: ChildHandle,
    /// OS process ID.
    pub pid: u32,
    /// Parent-side write end of the child's stdin, when piped.
    pub stdin: Option<ChildStdin>,
    /// Parent-side read end of the child's stdout, when piped.
    pub stdout: Option<ChildStdout>,
    /// Parent-side read end of the child's stderr, when piped.
    pub stderr: Option<ChildStderr>,
}

/// Result of a non-blocking exit poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPoll {
    /// The child is still alive.
    Running,
    /// The child has exited; the code is absent when it was killed by a
    /// signal.
    Exited(Option<i32>),
}

/// Spawn failures.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The executable could not be launched.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The OS did not report a PID for the spawned child.
    #[error("failed to get process ID")]
    MissingPid,
}

/// Liveness-poll and termination failures.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// I/O error talking to the OS process machinery.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The graceful-shutdown signal could not be delivered.
    #[error("failed to signal child: {0}")]
    SignalFailed(String),
}

/// Launch the configured executable.
///
/// `config.env` is applied as additions over the parent environment;
/// colliding names take the configured value. On Windows the child is
/// created in a new process group so a console break event can later be
/// delivered to it alone.
///
/// # Errors
///
/// Returns [`SpawnError`] if the executable cannot be launched or the PID
/// cannot be obtained.
pub fn spawn(config: &ProcessConfig, io: SpawnIo) -> Result<SpawnedChild, SpawnError> {
    let mut cmd = Command::new(&config.executable_path);
    cmd.args(&config.args).kill_on_drop(false);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    match io {
        SpawnIo::Inherit => {
            cmd.stdin(Stdio::null());
        }
        SpawnIo::Piped => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
    }

    #[cfg(windows)]
    cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP);

    let mut child = cmd
        .spawn()
        .map_err(|err| SpawnError::SpawnFailed(err.to_string()))?;
    let pid = child.id().ok_or(SpawnError::MissingPid)?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    Ok(SpawnedChild {
        handle: ChildHandle { child },
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Non-blocking exit check. Reaps the child if it has exited.
///
/// # Errors
///
/// Returns [`AdapterError::Io`] if the poll itself fails.
pub fn poll_exit(handle: &mut ChildHandle) -> Result<ExitPoll, AdapterError> {
    match handle.child.try_wait()? {
        None => Ok(ExitPoll::Running),
        Some(status) => Ok(ExitPoll::Exited(status.code())),
    }
}

/// Terminate the child and reap it, consuming the handle.
///
/// With `force = false`, a graceful shutdown is requested first (SIGTERM on
/// POSIX, a console break event to the child's process group on Windows)
/// and the child is given [`GRACE_TIMEOUT`] to exit before the hard kill.
/// With `force = true`, the hard kill is immediate.
///
/// Returns the exit code when the child reported one.
///
/// # Errors
///
/// Returns [`AdapterError`] if the child cannot be killed or reaped.
pub async fn terminate(mut handle: ChildHandle, force: bool) -> Result<Option<i32>, AdapterError> {
    if force {
        return hard_kill(&mut handle.child).await;
    }

    // A failed signal usually means the child already exited; the wait
    // below resolves either way.
    if let Err(err) = request_graceful_exit(&handle.child) {
        debug!("graceful shutdown signal not delivered: {err}");
    }

    match tokio::time::timeout(GRACE_TIMEOUT, handle.child.wait()).await {
        Ok(status) => Ok(status?.code()),
        Err(_) => hard_kill(&mut handle.child).await,
    }
}

async fn hard_kill(child: &mut Child) -> Result<Option<i32>, AdapterError> {
    match child.start_kill() {
        Ok(()) => {}
        // The child exited between the poll and the kill; wait() below
        // still yields its status.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(err) => return Err(err.into()),
    }
    let status = child.wait().await?;
    Ok(status.code())
}

#[cfg(unix)]
fn request_graceful_exit(child: &Child) -> Result<(), AdapterError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = child
        .id()
        .ok_or_else(|| AdapterError::SignalFailed("process already reaped".to_string()))?;
    #[allow(clippy::cast_possible_wrap)] // OS pids fit in i32
    let pid = pid as i32;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|err| AdapterError::SignalFailed(err.to_string()))
}

#[cfg(windows)]
fn request_graceful_exit(child: &Child) -> Result<(), AdapterError> {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    let pid = child
        .id()
        .ok_or_else(|| AdapterError::SignalFailed("process already reaped".to_string()))?;
    // The child was created with CREATE_NEW_PROCESS_GROUP, so the break
    // event reaches its group without touching the supervisor's console.
    let delivered = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
    if delivered == 0 {
        return Err(AdapterError::SignalFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}
