//! Ownership and supervision of the hypervisor child process.
//!
//! ```text
//! spawn(LaunchCommand)
//!     └─► tokio::process::Child ─► monitor task
//!             ├─ child.wait()      ─► watch<Option<ExitInfo>> + ProcessEvent::Exited
//!             └─ kill oneshot      ─► start_kill, then wait
//! stop(grace)
//!     └─► SIGTERM (taskkill on Windows) ─► wait grace ─► forced kill
//! ```
//!
//! At most one process is supervised at a time. Exit notifications carry a
//! generation number so a late event from an old process is never applied to
//! its successor.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::launch::LaunchCommand;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal on Unix.
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Zero exit code.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Notification sent to the orchestrator when a process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Exited {
        generation: u64,
        pid: u32,
        exit: ExitInfo,
    },
}

/// Result of [`ProcessSupervisor::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    NotRunning,
    /// Exited within the grace period.
    Graceful,
    /// Had to be killed.
    Forced,
}

struct SupervisedProcess {
    generation: u64,
    pid: u32,
    program: String,
    exited: watch::Receiver<Option<ExitInfo>>,
    /// Sending, or dropping, asks the monitor to kill the child.
    kill: Option<oneshot::Sender<()>>,
}

impl SupervisedProcess {
    fn exit(&self) -> Option<ExitInfo> {
        *self.exited.borrow()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct ProcessSupervisor {
    events: mpsc::UnboundedSender<ProcessEvent>,
    console_log: Option<PathBuf>,
    next_generation: u64,
    current: Option<SupervisedProcess>,
}

impl ProcessSupervisor {
    /// Exit events go to `events`. Child stdout/stderr are appended to
    /// `console_log` when set, discarded otherwise.
    pub fn new(events: mpsc::UnboundedSender<ProcessEvent>, console_log: Option<PathBuf>) -> Self {
        Self {
            events,
            console_log,
            next_generation: 1,
            current: None,
        }
    }

    /// The supervised process has been spawned and not yet observed to exit.
    pub fn is_alive(&self) -> bool {
        self.current.as_ref().is_some_and(|p| p.exit().is_none())
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().map(|p| p.pid)
    }

    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|p| p.generation)
    }

    /// Exit details of the current process, if it has ended.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.current.as_ref().and_then(SupervisedProcess::exit)
    }

    /// Forget the current process if it is `generation` and has exited.
    /// Returns whether the event referred to the current process.
    pub fn acknowledge_exit(&mut self, generation: u64) -> bool {
        match &self.current {
            Some(p) if p.generation == generation => {
                if p.exit().is_some() {
                    self.current = None;
                }
                true
            }
            _ => false,
        }
    }

    /// Resolves once the current process exits. Pending forever when nothing
    /// is supervised.
    pub async fn wait_for_exit(&self) -> ExitInfo {
        let Some(p) = &self.current else {
            return std::future::pending().await;
        };
        let mut rx = p.exited.clone();
        // A monitor gone without reporting reads as an unexplained exit.
        wait_exited(&mut rx).await.unwrap_or_default()
    }

    /// Run a preparatory command to completion.
    pub async fn run_prepare(&self, cmd: &LaunchCommand) -> Result<()> {
        debug!(command = %cmd.display(), "running launch preparation");
        let output = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::LaunchPrepare {
                program: cmd.program.clone(),
                detail: format!(
                    "exit {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    /// Spawn `cmd` and start monitoring it. Returns the pid.
    pub fn spawn(&mut self, cmd: &LaunchCommand) -> Result<u32> {
        if let Some(pid) = self.pid().filter(|_| self.is_alive()) {
            return Err(Error::AlreadyRunning(pid));
        }

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match self.console_stdio() {
            Some((out, err)) => {
                command.stdout(out).stderr(err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let generation = self.next_generation;
        self.next_generation += 1;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "failed to kill VM process");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!(pid, error = %e, "error waiting for VM process");
                    ExitInfo::default()
                }
            };
            info!(pid, code = ?exit.code, signal = ?exit.signal, "VM process exited");
            let _ = exit_tx.send(Some(exit));
            let _ = events.send(ProcessEvent::Exited {
                generation,
                pid,
                exit,
            });
        });

        info!(pid, generation, command = %cmd.display(), "VM process spawned");
        self.current = Some(SupervisedProcess {
            generation,
            pid,
            program: cmd.program.clone(),
            exited: exit_rx,
            kill: Some(kill_tx),
        });
        Ok(pid)
    }

    /// Terminate the current process: polite request, `grace` to comply,
    /// then a forced kill. A kill that is never confirmed is logged and
    /// still reported as `Forced`.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        let Some(mut process) = self.current.take() else {
            return StopOutcome::NotRunning;
        };
        if process.exit().is_some() {
            return StopOutcome::NotRunning;
        }

        info!(pid = process.pid, program = %process.program, "stopping VM process");
        request_termination(process.pid).await;

        let mut exited = process.exited.clone();
        if tokio::time::timeout(grace, wait_exited(&mut exited))
            .await
            .is_ok()
        {
            info!(pid = process.pid, "VM process exited gracefully");
            return StopOutcome::Graceful;
        }

        warn!(pid = process.pid, grace_ms = grace.as_millis() as u64, "grace period elapsed, killing VM process");
        force_kill_group(process.pid);
        if let Some(kill) = process.kill.take() {
            let _ = kill.send(());
        }
        let kill_wait = grace.max(Duration::from_secs(1));
        if tokio::time::timeout(kill_wait, wait_exited(&mut exited))
            .await
            .is_err()
        {
            warn!(pid = process.pid, "VM process did not report exit after kill");
        }
        StopOutcome::Forced
    }

    fn console_stdio(&self) -> Option<(Stdio, Stdio)> {
        let path = self.console_log.as_ref()?;
        let open = || OpenOptions::new().create(true).append(true).open(path);
        match (open(), open()) {
            (Ok(out), Ok(err)) => Some((Stdio::from(out), Stdio::from(err))),
            (Err(e), _) | (_, Err(e)) => {
                warn!(path = %path.display(), error = %e, "cannot open console log, discarding VM output");
                None
            }
        }
    }
}

async fn wait_exited(rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit)
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("pid", &self.pid())
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Platform signalling
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn request_termination(pid: u32) {
    // The child leads its own process group; signal the whole group so
    // wrapper scripts take their children down with them.
    signal_group(pid, libc::SIGTERM);
}

#[cfg(windows)]
async fn request_termination(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!(pid, error = %e, "taskkill failed");
    }
}

#[cfg(not(any(unix, windows)))]
async fn request_termination(_pid: u32) {}

#[cfg(unix)]
fn force_kill_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn force_kill_group(_pid: u32) {}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        debug!(pid, signal, error = %std::io::Error::last_os_error(), "kill(2) failed");
    }
}
