//! Launch and stop policy around one daemon's processes, plus application
//! of reaped exits.

use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::{Global, ProcessRef, Supervisor};
use super::launcher::{ExitEvent, LaunchRequest, Signal};
use super::process::{ExitInfo, Process, ProcessRole, Readiness};
use super::registry::Daemon;
use super::stderr_log;
use super::wait::wait_until;
use crate::clienv;
use crate::error::{Result, SupervisorError};

impl Supervisor {
    /// Starts a daemon's primary process. Refused once finalizing.
    pub fn start(&self, daemon: &Arc<Daemon>) -> Result<u32> {
        self.start_process(daemon, ProcessRole::Primary, false)
    }

    fn start_process(&self, daemon: &Arc<Daemon>, role: ProcessRole, during_finalize: bool) -> Result<u32> {
        let process = daemon
            .process(role)
            .ok_or_else(|| SupervisorError::UnknownDaemon(format!("{} ({})", daemon.name(), role.as_str())))?;

        // Checked again before launching; this pass keeps a refused start
        // from rotating the logs of a live process.
        self.check_startable(daemon, process, during_finalize)?;
        let request = self.launch_request(daemon, process);

        let mut global = self.lock();
        self.check_startable_locked(&global, daemon, process, during_finalize)?;
        process
            .lock(&global)
            .reset_for_start(role == ProcessRole::Primary && daemon.start_wait());

        // Launch under the global lock so the exit consumer cannot see the
        // PID before it is in the table.
        let pid = self
            .launcher()
            .launch(&request, self.exits().clone())
            .map_err(|source| SupervisorError::Launch {
                daemon: daemon.name().to_string(),
                source,
            })?;

        {
            let mut state = process.lock(&global);
            state.pid = pid;
            state.started_at = Some(SystemTime::now());
        }
        global.pids.insert(
            pid,
            ProcessRef {
                daemon: Arc::clone(daemon),
                role,
            },
        );
        drop(global);

        process.wake();
        debug!(pid, role = role.as_str(), "Started '{}'", daemon.name());
        Ok(pid)
    }

    fn check_startable(&self, daemon: &Daemon, process: &Process, during_finalize: bool) -> Result<()> {
        let global = self.lock();
        self.check_startable_locked(&global, daemon, process, during_finalize)
    }

    fn check_startable_locked(
        &self,
        global: &Global<'_>,
        daemon: &Daemon,
        process: &Process,
        during_finalize: bool,
    ) -> Result<()> {
        if global.is_finalizing() && !during_finalize {
            return Err(SupervisorError::Cancelled);
        }
        let state = process.lock(global);
        if state.is_running() {
            return Err(SupervisorError::AlreadyRunning {
                daemon: daemon.name().to_string(),
                pid: state.pid,
            });
        }
        Ok(())
    }

    fn launch_request(&self, daemon: &Daemon, process: &Process) -> LaunchRequest {
        let settings = self.settings();
        let stderr_log = match std::fs::create_dir_all(&settings.log_dir) {
            Ok(()) => Some(stderr_log::log_path(&settings.log_dir, daemon.name())),
            Err(e) => {
                warn!("Cannot create log dir {}: {}", settings.log_dir.display(), e);
                None
            }
        };

        if process.role() == ProcessRole::Primary {
            if let (Some(keep), Some(path)) = (daemon.stderr_rotate(), stderr_log.as_ref()) {
                if let Err(e) = stderr_log::rotate(path, keep) {
                    warn!("Failed to rotate stderr log of '{}': {}", daemon.name(), e);
                }
            }
        }

        LaunchRequest {
            daemon: daemon.name().to_string(),
            role: process.role(),
            argv: process.argv().to_vec(),
            env: vec![
                (
                    clienv::SOCKET_ENV.to_string(),
                    settings.socket_path.display().to_string(),
                ),
                (clienv::DAEMON_NAME_ENV.to_string(), daemon.name().to_string()),
            ],
            work_dir: Some(settings.work_dir.clone()).filter(|dir| dir.is_dir()),
            stderr_log,
        }
    }

    /// Blocks until the daemon reports ready, dies, finalization starts, or
    /// `deadline` passes.
    pub async fn wait_ready(&self, daemon: &Daemon, deadline: Instant) -> Result<()> {
        let process = daemon.primary();
        let outcome = wait_until(process.changed(), deadline, || {
            let global = self.lock();
            let finalizing = global.is_finalizing();
            let state = process.lock(&global);
            if finalizing {
                Some(Err(SupervisorError::Cancelled))
            } else if !state.is_running() {
                Some(Err(SupervisorError::DaemonDied(daemon.name().to_string())))
            } else if state.readiness != Readiness::Awaiting {
                Some(Ok(()))
            } else {
                None
            }
        })
        .await;

        match outcome {
            Some(result) => result,
            None => Err(SupervisorError::Timeout(format!("'{}' to become ready", daemon.name()))),
        }
    }

    /// Blocks until the run identified by `pid` is gone and returns its exit.
    /// Finalization does not cut this wait short: stops run during finalization.
    async fn wait_exit(&self, process: &Process, pid: u32, deadline: Instant) -> Option<ExitInfo> {
        wait_until(process.changed(), deadline, || {
            let global = self.lock();
            let state = process.lock(&global);
            (state.pid != pid).then(|| {
                state.last_exit.unwrap_or(ExitInfo {
                    code: None,
                    signal: None,
                })
            })
        })
        .await
    }

    /// Stops a daemon: stop command first, configured signal as fallback,
    /// then waits for the primary process to exit. `Ok(None)` if it was not running.
    pub async fn stop(&self, daemon: &Arc<Daemon>, deadline: Instant) -> Result<Option<ExitInfo>> {
        let process = daemon.primary();
        let pid = {
            let global = self.lock();
            let mut state = process.lock(&global);
            if !state.is_running() {
                return Ok(None);
            }
            state.stopping = true;
            state.pid
        };
        info!("Stopping '{}' (PID {})", daemon.name(), pid);

        let mut requested = false;
        if daemon.stop_process().is_some() {
            match self.run_stop_command(daemon, stop_command_deadline(deadline)).await {
                Ok(()) => requested = true,
                Err(e) => warn!(
                    "Stop command of '{}' failed ({}), sending {}",
                    daemon.name(),
                    e,
                    daemon.stop_signal()
                ),
            }
        }

        if !requested {
            if let Err(source) = self.launcher().signal(pid, daemon.stop_signal()) {
                // NotFound: the process is gone and its exit is not applied yet.
                if source.kind() != io::ErrorKind::NotFound && self.pid_of(daemon.name()) == Some(pid) {
                    return Err(SupervisorError::Signal {
                        daemon: daemon.name().to_string(),
                        source,
                    });
                }
                debug!("'{}' (PID {}) already exiting: {}", daemon.name(), pid, source);
            }
        }

        match self.wait_exit(process, pid, deadline).await {
            Some(exit) => {
                info!("'{}' (PID {}) stopped: {}", daemon.name(), pid, exit);
                Ok(Some(exit))
            }
            None => Err(SupervisorError::Timeout(format!("'{}' to exit", daemon.name()))),
        }
    }

    async fn run_stop_command(&self, daemon: &Arc<Daemon>, deadline: Instant) -> Result<()> {
        let Some(stop) = daemon.stop_process() else {
            return Ok(());
        };
        let pid = self.start_process(daemon, ProcessRole::Stop, true)?;
        let Some(exit) = self.wait_exit(stop, pid, deadline).await else {
            if let Err(e) = self.launcher().signal(pid, Signal::Kill) {
                debug!("Could not kill stop command of '{}' (PID {}): {}", daemon.name(), pid, e);
            }
            return Err(SupervisorError::StopCommand {
                daemon: daemon.name().to_string(),
                reason: "did not finish in time".to_string(),
            });
        };

        if !exit.success() {
            return Err(SupervisorError::StopCommand {
                daemon: daemon.name().to_string(),
                reason: exit.to_string(),
            });
        }
        Ok(())
    }

    /// Applies one reaped exit. Runs on the exit consumer task.
    pub(crate) fn apply_exit(&self, event: ExitEvent) {
        let mut global = self.lock();
        let Some(entry) = global.pids.remove(&event.pid) else {
            self.exits().applied();
            drop(global);
            debug!("Exit of untracked PID {}: {}", event.pid, event.exit);
            self.wake_context();
            return;
        };

        let finalizing = global.is_finalizing();
        let daemon = entry.daemon;
        let Some(process) = daemon.process(entry.role) else {
            self.exits().applied();
            drop(global);
            self.wake_context();
            return;
        };

        let was_stopping = {
            let mut state = process.lock(&global);
            state.pid = 0;
            state.last_exit = Some(event.exit);
            state.stopping
        };

        let fatal = entry.role == ProcessRole::Primary
            && daemon.is_mandatory()
            && !finalizing
            && !was_stopping;
        // Finalize under the same lock that clears the PID so no waiter sees
        // the death without also seeing the shutdown.
        if fatal {
            global.enter_finalizing();
            self.shutdown_handle()
                .shutdown(&format!("mandatory daemon '{}' died", daemon.name()));
        }

        self.exits().applied();
        drop(global);

        if fatal {
            self.wake_all();
        } else {
            process.wake();
            self.wake_context();
        }

        match entry.role {
            ProcessRole::Stop => debug!("Stop command of '{}' exited: {}", daemon.name(), event.exit),
            ProcessRole::Primary if fatal => error!(
                "Mandatory daemon '{}' (PID {}) exited: {}; shutting down",
                daemon.name(),
                event.pid,
                event.exit
            ),
            ProcessRole::Primary if finalizing || was_stopping => {
                debug!("'{}' (PID {}) exited: {}", daemon.name(), event.pid, event.exit)
            }
            ProcessRole::Primary => warn!(
                "Daemon '{}' (PID {}) exited unexpectedly: {}",
                daemon.name(),
                event.pid,
                event.exit
            ),
        }
    }
}

/// The stop command gets half of the remaining stop budget; the rest is kept
/// for the stop signal.
fn stop_command_deadline(deadline: Instant) -> Instant {
    let now = Instant::now();
    now + deadline.saturating_duration_since(now) / 2
}
