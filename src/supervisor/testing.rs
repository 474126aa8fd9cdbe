//! Fakes for the launcher and event channel, and a harness wiring them to a
//! supervisor rooted in a scratch directory.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::channel::{ClusterEvent, EventSender};
use super::context::Supervisor;
use super::launcher::{ExitEvent, ExitSink, LaunchRequest, ProcessLauncher, Signal};
use super::process::{ExitInfo, ProcessRole, Readiness};
use super::registry::{Daemon, DaemonEntry, Registry};
use super::shutdown::ShutdownCoordinator;
use super::wait::wait_until;
use crate::config::Settings;
use crate::error::{Result, SupervisorError};

const WAIT: Duration = Duration::from_secs(5);

struct LiveChild {
    request: LaunchRequest,
    sink: ExitSink,
}

#[derive(Default)]
struct LauncherState {
    launched: Vec<LaunchRequest>,
    signals: Vec<(u32, Signal)>,
    live: HashMap<u32, LiveChild>,
    vanished: HashMap<u32, LiveChild>,
    fail_launch: HashSet<String>,
    exit_on_launch: HashMap<String, i32>,
    stop_command_exit: i32,
    stop_command_hangs: bool,
    deaf: bool,
    heeded: Option<Signal>,
}

/// Launcher that hands out fake PIDs and exits them on demand.
///
/// Signals terminate the target unless ignored. A stop command exits with the
/// configured code and, on success, takes its daemon's primary down with it.
pub(crate) struct FakeLauncher {
    next_pid: AtomicU32,
    state: Mutex<LauncherState>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            state: Mutex::new(LauncherState::default()),
        }
    }

    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn fail_launch(&self, program: &str) {
        self.state.lock().unwrap().fail_launch.insert(program.to_string());
    }

    pub fn exit_on_launch(&self, program: &str, code: i32) {
        self.state.lock().unwrap().exit_on_launch.insert(program.to_string(), code);
    }

    pub fn stop_command_exit(&self, code: i32) {
        self.state.lock().unwrap().stop_command_exit = code;
    }

    /// Stop commands stay alive until signalled.
    pub fn hang_stop_command(&self) {
        self.state.lock().unwrap().stop_command_hangs = true;
    }

    pub fn ignore_signals(&self, deaf: bool) {
        let mut state = self.state.lock().unwrap();
        state.deaf = deaf;
        state.heeded = None;
    }

    pub fn ignore_signals_except(&self, signal: Signal) {
        let mut state = self.state.lock().unwrap();
        state.deaf = true;
        state.heeded = Some(signal);
    }

    /// Terminates a fake child with an exit code.
    pub fn exit(&self, pid: u32, code: i32) {
        let mut state = self.state.lock().unwrap();
        Self::terminate(&mut state, pid, ExitInfo::exited(code));
    }

    /// The child disappears from the process table but its exit is held
    /// back until `release`.
    pub fn vanish(&self, pid: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(child) = state.live.remove(&pid) {
            state.vanished.insert(pid, child);
        }
    }

    pub fn release(&self, pid: u32, code: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(child) = state.vanished.remove(&pid) {
            child.sink.deliver(ExitEvent {
                pid,
                exit: ExitInfo::exited(code),
            });
        }
    }

    fn terminate(state: &mut LauncherState, pid: u32, exit: ExitInfo) -> bool {
        match state.live.remove(&pid) {
            Some(child) => {
                child.sink.deliver(ExitEvent { pid, exit });
                true
            }
            None => false,
        }
    }

    fn primary_of(state: &LauncherState, daemon: &str) -> Option<u32> {
        state
            .live
            .iter()
            .find(|(_, child)| child.request.daemon == daemon && child.request.role == ProcessRole::Primary)
            .map(|(pid, _)| *pid)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest, exits: ExitSink) -> io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.launched.push(request.clone());

        let program = request.argv.first().cloned().unwrap_or_default();
        if state.fail_launch.contains(&program) {
            return Err(io::Error::new(io::ErrorKind::NotFound, program));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        state.live.insert(
            pid,
            LiveChild {
                request: request.clone(),
                sink: exits,
            },
        );

        if request.role == ProcessRole::Stop {
            if state.stop_command_hangs {
                return Ok(pid);
            }
            let code = state.stop_command_exit;
            if code == 0 {
                if let Some(primary) = Self::primary_of(&state, &request.daemon) {
                    Self::terminate(&mut state, primary, ExitInfo::exited(0));
                }
            }
            Self::terminate(&mut state, pid, ExitInfo::exited(code));
        } else if let Some(code) = state.exit_on_launch.get(&program).copied() {
            Self::terminate(&mut state, pid, ExitInfo::exited(code));
        }

        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.signals.push((pid, signal));
        if !state.live.contains_key(&pid) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
        }
        if state.deaf && state.heeded != Some(signal) {
            return Ok(());
        }
        Self::terminate(&mut state, pid, ExitInfo::signaled(signal.raw()));
        Ok(())
    }
}

/// How a fake daemon answers a cluster event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Answer {
    Ack,
    Reject,
    /// Never answers
    Ignore,
    /// Delivery itself fails
    FailDelivery,
    AckAfter(Duration),
}

/// Event sender that answers on the daemon's behalf through the supervisor.
pub(crate) struct FakeSender {
    supervisor: OnceLock<Weak<Supervisor>>,
    answers: Mutex<HashMap<String, Answer>>,
    delivered: Mutex<Vec<String>>,
    changed: Notify,
}

impl FakeSender {
    pub fn new() -> Self {
        Self {
            supervisor: OnceLock::new(),
            answers: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    fn attach(&self, supervisor: &Arc<Supervisor>) {
        let _ = self.supervisor.set(Arc::downgrade(supervisor));
    }

    pub fn answer(&self, daemon: &str, answer: Answer) {
        self.answers.lock().unwrap().insert(daemon.to_string(), answer);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub async fn wait_for_deliveries(&self, n: usize) {
        wait_until(&self.changed, Instant::now() + WAIT, || {
            (self.delivered.lock().unwrap().len() >= n).then_some(())
        })
        .await
        .expect("deliveries did not arrive");
    }
}

#[async_trait]
impl EventSender for FakeSender {
    async fn deliver(&self, daemon: &Daemon, _channel: Option<&str>, event: &ClusterEvent) -> Result<()> {
        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(daemon.name())
            .copied()
            .unwrap_or(Answer::Ack);

        if answer == Answer::FailDelivery {
            return Err(SupervisorError::EventFailed {
                daemon: daemon.name().to_string(),
                event: event.event_type,
                reason: "connection refused".to_string(),
            });
        }

        self.delivered.lock().unwrap().push(daemon.name().to_string());
        self.changed.notify_waiters();

        let (delay, success) = match answer {
            Answer::Ack => (Duration::ZERO, true),
            Answer::Reject => (Duration::ZERO, false),
            Answer::AckAfter(delay) => (delay, true),
            Answer::Ignore | Answer::FailDelivery => return Ok(()),
        };

        let supervisor = self.supervisor.get().and_then(Weak::upgrade);
        if let Some(supervisor) = supervisor {
            if let Some(pid) = supervisor.pid_of(daemon.name()) {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = supervisor.acknowledge(pid, success);
                });
            }
        }
        Ok(())
    }
}

pub(crate) struct Harness {
    pub supervisor: Arc<Supervisor>,
    pub launcher: Arc<FakeLauncher>,
    pub events: Arc<FakeSender>,
    pub shutdown: ShutdownCoordinator,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(entries: Vec<DaemonEntry>) -> Self {
        Self::with_settings(entries, |_| {})
    }

    pub fn with_settings(entries: Vec<DaemonEntry>, configure: impl FnOnce(&mut Settings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::rooted_at(dir.path());
        configure(&mut settings);

        let config_path = dir.path().join("daemons.toml");
        let registry = Registry::from_entries(entries.into_iter().map(|entry| (config_path.clone(), entry))).unwrap();

        let launcher = Arc::new(FakeLauncher::new());
        let events = Arc::new(FakeSender::new());
        let shutdown = ShutdownCoordinator::new();
        let supervisor = Supervisor::new(
            settings,
            registry,
            Arc::clone(&launcher) as Arc<dyn ProcessLauncher>,
            Arc::clone(&events) as Arc<dyn EventSender>,
            shutdown.handle(),
        );
        events.attach(&supervisor);

        Self {
            supervisor,
            launcher,
            events,
            shutdown,
            dir,
        }
    }

    pub fn daemon(&self, name: &str) -> Arc<Daemon> {
        Arc::clone(self.supervisor.registry().get(name).expect("daemon not registered"))
    }

    /// Runs the boot sequence while answering every ready wait.
    pub async fn boot(&self) {
        let supervisor = Arc::clone(&self.supervisor);
        let responder = tokio::spawn(async move {
            loop {
                for (pid, name) in awaiting_ready(&supervisor) {
                    let _ = supervisor.notify_ready(pid, Some(format!("/run/{name}.sock")));
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        let result = self.supervisor.start_all().await;
        responder.abort();
        result.expect("boot failed");
    }

    pub async fn wait_pid_cleared(&self, name: &str) {
        let daemon = self.daemon(name);
        wait_until(daemon.primary().changed(), Instant::now() + WAIT, || {
            self.supervisor.pid_of(name).is_none().then_some(())
        })
        .await
        .expect("pid was not cleared");
    }

    pub async fn wait_drained(&self) {
        wait_until(self.supervisor.context_changed(), Instant::now() + WAIT, || {
            self.supervisor.children_drained().then_some(())
        })
        .await
        .expect("children were not drained");
    }

    pub fn inject_exit(&self, pid: u32, exit: ExitInfo) {
        self.supervisor.exits().deliver(ExitEvent { pid, exit });
    }
}

fn awaiting_ready(supervisor: &Supervisor) -> Vec<(u32, String)> {
    let global = supervisor.lock();
    supervisor
        .registry()
        .daemons()
        .filter_map(|daemon| {
            let state = daemon.primary().lock(&global);
            (state.is_running() && state.readiness == Readiness::Awaiting)
                .then(|| (state.pid, daemon.name().to_string()))
        })
        .collect()
}
