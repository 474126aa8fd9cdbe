//! One OS-level execution slot of a daemon.
//!
//! A [`Process`] is owned by exactly one daemon. Its mutable fields live
//! behind a per-process mutex that can only be locked while the supervisor's
//! global lock is held: [`Process::lock`] demands a [`Global`] guard.

use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::Notify;

use super::context::Global;

/// Which of a daemon's processes this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// The long-running daemon itself
    Primary,
    /// The optional command that asks the daemon to stop
    Stop,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Primary => "primary",
            ProcessRole::Stop => "stop",
        }
    }
}

/// Observed termination of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code for a normal exit
    pub code: Option<i32>,
    /// Terminating signal number when killed by a signal
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Single integer status for the wire: the exit code, or `128 + signal`.
    pub fn status_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Ready-notification progress of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Daemon does not report readiness
    NotRequired,
    /// Launched, waiting for the daemon's ready notification
    Awaiting,
    /// Ready notification received
    Ready,
}

/// Progress of the cluster event currently delivered to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDelivery {
    Idle,
    InFlight,
    Acknowledged,
    Rejected,
}

/// Mutable fields of a [`Process`].
#[derive(Debug)]
pub struct ProcessState {
    /// 0 when not running
    pub pid: u32,
    pub last_exit: Option<ExitInfo>,
    pub readiness: Readiness,
    pub event: EventDelivery,
    /// Set while a stop of this process is in progress
    pub stopping: bool,
    /// Control channel the daemon registered with its ready notification
    pub channel: Option<String>,
    pub started_at: Option<SystemTime>,
}

impl ProcessState {
    fn new() -> Self {
        Self {
            pid: 0,
            last_exit: None,
            readiness: Readiness::NotRequired,
            event: EventDelivery::Idle,
            stopping: false,
            channel: None,
            started_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid != 0
    }

    /// Clears transient state ahead of a (re)start.
    pub(crate) fn reset_for_start(&mut self, await_ready: bool) {
        self.last_exit = None;
        self.readiness = if await_ready {
            Readiness::Awaiting
        } else {
            Readiness::NotRequired
        };
        self.event = EventDelivery::Idle;
        self.stopping = false;
        self.channel = None;
        self.started_at = None;
    }
}

pub struct Process {
    role: ProcessRole,
    argv: Vec<String>,
    state: Mutex<ProcessState>,
    changed: Notify,
}

impl Process {
    pub fn new(role: ProcessRole, argv: Vec<String>) -> Self {
        Self {
            role,
            argv,
            state: Mutex::new(ProcessState::new()),
            changed: Notify::new(),
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Locks this process. The global guard proves lock ordering.
    pub(crate) fn lock<'a>(&'a self, _global: &'a Global<'_>) -> MutexGuard<'a, ProcessState> {
        self.state.lock().expect("process lock poisoned")
    }

    /// Condition signalled whenever this process's state changes.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    pub(crate) fn wake(&self) {
        self.changed.notify_waiters();
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("role", &self.role)
            .field("argv", &self.argv)
            .finish_non_exhaustive()
    }
}
