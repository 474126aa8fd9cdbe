//! Process launch primitive and asynchronous exit delivery.
//!
//! The supervisor never calls `spawn`/`kill` directly; it goes through a
//! [`ProcessLauncher`]. Exits are reported by a reaper task per child which
//! hands an [`ExitEvent`] to the [`ExitSink`]; a single consumer applies them.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::process::{ExitInfo, ProcessRole};

/// Signals the supervisor may send to a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Abrt,
    Kill,
    Usr1,
    Usr2,
    Term,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Abrt => "SIGABRT",
            Signal::Kill => "SIGKILL",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
            Signal::Term => "SIGTERM",
        }
    }

    #[cfg(unix)]
    pub fn raw(&self) -> i32 {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Abrt => libc::SIGABRT,
            Signal::Kill => libc::SIGKILL,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Term => libc::SIGTERM,
        }
    }

    #[cfg(not(unix))]
    pub fn raw(&self) -> i32 {
        match self {
            Signal::Hup => 1,
            Signal::Int => 2,
            Signal::Quit => 3,
            Signal::Abrt => 6,
            Signal::Kill => 9,
            Signal::Usr1 => 10,
            Signal::Usr2 => 12,
            Signal::Term => 15,
        }
    }
}

impl FromStr for Signal {
    type Err = ();

    /// Accepts `SIGTERM`, `TERM` and `term` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "HUP" => Ok(Signal::Hup),
            "INT" => Ok(Signal::Int),
            "QUIT" => Ok(Signal::Quit),
            "ABRT" => Ok(Signal::Abrt),
            "KILL" => Ok(Signal::Kill),
            "USR1" => Ok(Signal::Usr1),
            "USR2" => Ok(Signal::Usr2),
            "TERM" => Ok(Signal::Term),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub daemon: String,
    pub role: ProcessRole,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: Option<PathBuf>,
    /// Stderr is appended here when set
    pub stderr_log: Option<PathBuf>,
}

/// A child has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: u32,
    pub exit: ExitInfo,
}

/// Hand-off point between reaper tasks and the exit consumer.
///
/// An event counts as in flight from [`ExitSink::deliver`] until the consumer
/// calls [`ExitSink::applied`].
#[derive(Clone)]
pub struct ExitSink {
    tx: mpsc::UnboundedSender<ExitEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl ExitSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn deliver(&self, event: ExitEvent) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).is_err() {
            // Consumer is gone; nobody will apply it.
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            debug!(pid = event.pid, "Exit event dropped, consumer closed");
        }
    }

    pub(crate) fn applied(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Exit events handed over but not yet applied.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Contract the supervisor requires from the OS process layer.
pub trait ProcessLauncher: Send + Sync {
    /// Starts the process and returns its PID. The exit must later be
    /// reported exactly once through `exits`.
    fn launch(&self, request: &LaunchRequest, exits: ExitSink) -> io::Result<u32>;

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;
}

/// Launches children with `tokio::process` and reaps each on its own task.
#[derive(Debug, Default)]
pub struct TokioLauncher;

impl TokioLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, request: &LaunchRequest, exits: ExitSink) -> io::Result<u32> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut cmd = Command::new(program);
        cmd.args(args);

        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        if let Some(ref dir) = request.work_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());

        match request.stderr_log {
            Some(ref path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stderr(Stdio::from(file));
            }
            None => {
                cmd.stderr(Stdio::inherit());
            }
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before reporting a PID"))?;
        info!(
            "Launched '{}' {} process with PID {}",
            request.daemon,
            request.role.as_str(),
            pid
        );

        let daemon = request.daemon.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!("Failed to reap '{}' (PID {}): {}", daemon, pid, e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            debug!("Reaped '{}' (PID {}): {}", daemon, pid, exit);
            exits.deliver(ExitEvent { pid, exit });
        });

        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid as i32, signal.raw()) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ESRCH) {
                    return Err(io::Error::new(io::ErrorKind::NotFound, format!("no process {}", pid)));
                }
                return Err(err);
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = (pid, signal);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "signals are only supported on unix",
            ))
        }
    }
}
