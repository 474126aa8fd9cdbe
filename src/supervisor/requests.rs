//! Request surface: admission and drain of in-flight requests, plus the
//! query and notification handlers that do not belong to another component.

use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::time::Instant;
use tracing::{info, warn};

use super::context::{Phase, Supervisor};
use super::process::{ProcessRole, Readiness};
use super::protocol::{DaemonStatus, StatusEntry, VerboseEntry, VerboseStatus};
use super::registry::Daemon;
use super::stderr_log;
use super::wait::wait_until;
use crate::error::{Result, SupervisorError};

/// Counts one admitted request until dropped.
pub struct RequestGuard {
    supervisor: Arc<Supervisor>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let remaining = {
            let mut global = self.supervisor.lock();
            global.requests = global.requests.saturating_sub(1);
            global.requests
        };
        if remaining == 0 {
            self.supervisor.wake_context();
        }
    }
}

/// One requested name, resolved against the registry.
enum Lookup<'a> {
    Found(&'a Arc<Daemon>),
    Missing(String),
}

impl Supervisor {
    /// Admits a request unless finalizing. The count drops with the guard.
    pub fn admit(self: &Arc<Self>) -> Result<RequestGuard> {
        let mut global = self.lock();
        if global.is_finalizing() {
            return Err(SupervisorError::Cancelled);
        }
        global.requests += 1;
        Ok(RequestGuard {
            supervisor: Arc::clone(self),
        })
    }

    pub fn requests_in_flight(&self) -> usize {
        self.lock().requests
    }

    /// Waits for every admitted request to finish.
    pub async fn finalize_requests(&self, deadline: Instant) -> Result<()> {
        wait_until(self.context_changed(), deadline, || {
            (self.lock().requests == 0).then_some(())
        })
        .await
        .ok_or_else(|| {
            SupervisorError::Timeout(format!("{} in-flight request(s)", self.requests_in_flight()))
        })
    }

    /// Handles a ready notification from `pid`, registering its event channel.
    /// Rejections leave every process untouched.
    pub fn notify_ready(&self, pid: u32, channel: Option<String>) -> Result<()> {
        let global = self.lock();
        let Some(entry) = global.pids.get(&pid) else {
            warn!("Ready notification from unknown PID {}", pid);
            return Err(SupervisorError::UnknownPid(pid));
        };
        let daemon = Arc::clone(&entry.daemon);
        let not_awaiting = || SupervisorError::NotAwaitingReady {
            pid,
            daemon: daemon.name().to_string(),
        };
        if entry.role != ProcessRole::Primary {
            warn!("Ready notification from stop command of '{}' (PID {})", daemon.name(), pid);
            return Err(not_awaiting());
        }

        let process = daemon.primary();
        {
            let mut state = process.lock(&global);
            if state.readiness != Readiness::Awaiting {
                warn!("Unexpected ready notification from '{}' (PID {})", daemon.name(), pid);
                return Err(not_awaiting());
            }
            state.readiness = Readiness::Ready;
            state.channel = channel;
        }
        drop(global);

        process.wake();
        info!("'{}' (PID {}) is ready", daemon.name(), pid);
        Ok(())
    }

    fn lookup<'a>(&'a self, names: &[String]) -> Result<Vec<Lookup<'a>>> {
        if self.phase() == Phase::Boot {
            return Err(SupervisorError::Starting);
        }
        if names.is_empty() {
            return Ok(self.registry().daemons().map(Lookup::Found).collect());
        }
        Ok(names
            .iter()
            .map(|name| match self.registry().get(name) {
                Some(daemon) => Lookup::Found(daemon),
                None => Lookup::Missing(name.clone()),
            })
            .collect())
    }

    fn daemon_status(&self, daemon: &Daemon) -> DaemonStatus {
        let global = self.lock();
        let state = daemon.primary().lock(&global);
        DaemonStatus {
            name: daemon.name().to_string(),
            process_type: daemon.process_type().to_string(),
            pid: state.pid,
            channel: state.channel.clone(),
        }
    }

    /// Name, type, PID and channel of the named daemons, all when `names` is empty.
    pub fn status(&self, names: &[String]) -> Result<Vec<StatusEntry>> {
        Ok(self
            .lookup(names)?
            .into_iter()
            .map(|lookup| match lookup {
                Lookup::Found(daemon) => StatusEntry::Found(self.daemon_status(daemon)),
                Lookup::Missing(name) => StatusEntry::Missing {
                    message: SupervisorError::UnknownDaemon(name.clone()).to_string(),
                    name,
                },
            })
            .collect())
    }

    /// Status plus config path, description, stderr tail, start time, argv
    /// and last exit. Fields that cannot be read are `None`.
    pub fn verbose_status(&self, names: &[String]) -> Result<Vec<VerboseEntry>> {
        Ok(self
            .lookup(names)?
            .into_iter()
            .map(|lookup| match lookup {
                Lookup::Found(daemon) => VerboseEntry::Found(self.verbose_entry(daemon)),
                Lookup::Missing(name) => VerboseEntry::Missing {
                    message: SupervisorError::UnknownDaemon(name.clone()).to_string(),
                    name,
                },
            })
            .collect())
    }

    fn verbose_entry(&self, daemon: &Daemon) -> VerboseStatus {
        let status = self.daemon_status(daemon);
        let (started_at, last_exit) = {
            let global = self.lock();
            let state = daemon.primary().lock(&global);
            (state.started_at, state.last_exit)
        };

        let log = stderr_log::log_path(&self.settings().log_dir, daemon.name());
        let stderr_tail = stderr_log::tail(&log, self.settings().stderr_tail_lines).ok();

        VerboseStatus {
            status,
            config_path: daemon.config_path().display().to_string(),
            description: daemon.description().map(str::to_string),
            stderr_tail,
            start_time: started_at
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            argv: daemon.primary().argv().to_vec(),
            last_exit: last_exit.map(|exit| exit.status_code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::registry::DaemonEntry;
    use crate::supervisor::testing::Harness;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_counts_and_drains() {
        let harness = Harness::new(vec![]);
        let first = harness.supervisor.admit().unwrap();
        let second = harness.supervisor.admit().unwrap();
        assert_eq!(harness.supervisor.requests_in_flight(), 2);

        let drain = {
            let supervisor = Arc::clone(&harness.supervisor);
            tokio::spawn(async move {
                supervisor
                    .finalize_requests(Instant::now() + Duration::from_secs(2))
                    .await
            })
        };
        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(second);

        drain.await.unwrap().unwrap();
        assert_eq!(harness.supervisor.requests_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_times_out_with_stuck_request() {
        let harness = Harness::new(vec![]);
        let _stuck = harness.supervisor.admit().unwrap();
        let err = harness
            .supervisor
            .finalize_requests(Instant::now() + Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_no_admission_while_finalizing() {
        let harness = Harness::new(vec![]);
        harness.supervisor.begin_finalizing();
        assert!(matches!(harness.supervisor.admit(), Err(SupervisorError::Cancelled)));
        assert_eq!(harness.supervisor.requests_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ready_from_unknown_pid_mutates_nothing() {
        let harness = Harness::new(vec![DaemonEntry::new("a", ["/bin/a"]).start_wait(true)]);
        let daemon = harness.daemon("a");
        harness.supervisor.start(&daemon).unwrap();

        let err = harness
            .supervisor
            .notify_ready(424_242, Some("/run/x.sock".into()))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownPid(424_242)));

        let global = harness.supervisor.lock();
        let state = daemon.primary().lock(&global);
        assert_eq!(state.readiness, Readiness::Awaiting);
        assert!(state.channel.is_none());
    }

    #[tokio::test]
    async fn test_ready_registers_channel_once() {
        let harness = Harness::new(vec![
            DaemonEntry::new("a", ["/bin/a"]).start_wait(true),
            DaemonEntry::new("b", ["/bin/b"]),
        ]);
        let pid_a = harness.supervisor.start(&harness.daemon("a")).unwrap();
        let pid_b = harness.supervisor.start(&harness.daemon("b")).unwrap();

        harness
            .supervisor
            .notify_ready(pid_a, Some("/run/a.sock".into()))
            .unwrap();
        assert!(matches!(
            harness.supervisor.notify_ready(pid_a, None),
            Err(SupervisorError::NotAwaitingReady { .. })
        ));
        assert!(matches!(
            harness.supervisor.notify_ready(pid_b, None),
            Err(SupervisorError::NotAwaitingReady { .. })
        ));

        let daemon = harness.daemon("a");
        let global = harness.supervisor.lock();
        let state = daemon.primary().lock(&global);
        assert_eq!(state.channel.as_deref(), Some("/run/a.sock"));
    }

    #[tokio::test]
    async fn test_status_rejected_during_boot() {
        let harness = Harness::new(vec![DaemonEntry::new("a", ["/bin/a"])]);
        assert!(matches!(harness.supervisor.status(&[]), Err(SupervisorError::Starting)));
    }

    #[tokio::test]
    async fn test_status_all_is_idempotent() {
        let harness = Harness::new(vec![
            DaemonEntry::new("b", ["/bin/b"]).start_order(1),
            DaemonEntry::new("a", ["/bin/a"]).start_order(2),
        ]);
        harness.boot().await;

        let first = harness.supervisor.status(&[]).unwrap();
        let second = harness.supervisor.status(&[]).unwrap();
        assert_eq!(first, second);

        let names: Vec<_> = first
            .iter()
            .map(|entry| match entry {
                StatusEntry::Found(status) => status.name.as_str(),
                StatusEntry::Missing { name, .. } => name.as_str(),
            })
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_status_reports_unknown_names() {
        let harness = Harness::new(vec![DaemonEntry::new("a", ["/bin/a"]).start_order(1)]);
        harness.boot().await;

        let entries = harness
            .supervisor
            .status(&["a".to_string(), "ghost".to_string()])
            .unwrap();
        assert!(matches!(&entries[0], StatusEntry::Found(s) if s.pid == harness.supervisor.pid_of("a").unwrap()));
        assert!(matches!(&entries[1], StatusEntry::Missing { name, .. } if name == "ghost"));
    }

    #[tokio::test]
    async fn test_verbose_status_reads_stderr_tail() {
        let harness = Harness::new(vec![DaemonEntry::new("a", ["/bin/a", "--flag"]).start_order(1)]);
        harness.boot().await;

        let log = stderr_log::log_path(&harness.supervisor.settings().log_dir, "a");
        std::fs::write(&log, "one\ntwo\n").unwrap();

        let entries = harness.supervisor.verbose_status(&[]).unwrap();
        let VerboseEntry::Found(entry) = &entries[0] else {
            panic!("expected entry for 'a'");
        };
        assert_eq!(entry.stderr_tail.as_deref(), Some(&["one".to_string(), "two".to_string()][..]));
        assert_eq!(entry.argv, vec!["/bin/a", "--flag"]);
        assert!(entry.start_time.is_some());
        assert!(entry.last_exit.is_none());
    }

    #[tokio::test]
    async fn test_verbose_status_degrades_missing_log() {
        let harness = Harness::new(vec![DaemonEntry::new("a", ["/bin/a"]).start_order(1)]);
        harness.boot().await;
        let log = stderr_log::log_path(&harness.supervisor.settings().log_dir, "a");
        let _ = std::fs::remove_file(log);

        let entries = harness.supervisor.verbose_status(&[]).unwrap();
        let VerboseEntry::Found(entry) = &entries[0] else {
            panic!("expected entry for 'a'");
        };
        assert!(entry.stderr_tail.is_none());
    }
}
