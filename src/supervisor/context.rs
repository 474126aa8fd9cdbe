//! Supervisor context: the one explicitly constructed object every component
//! works through, and the global lock guarding its mutable state.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use super::channel::EventSender;
use super::cluster::ClusterStatus;
use super::launcher::{ExitEvent, ExitSink, ProcessLauncher};
use super::process::{Process, ProcessRole};
use super::registry::{Daemon, Registry};
use super::shutdown::ShutdownHandle;
use crate::config::Settings;

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Daemons are being started
    Boot,
    Running,
    /// Shutdown has begun; waits are cancelled and nothing new is admitted
    Finalizing,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Boot => "boot",
            Phase::Running => "running",
            Phase::Finalizing => "finalizing",
            Phase::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowPriorityStop {
    NotPosted,
    Posted,
    Done,
}

/// Who owns a live PID.
#[derive(Debug, Clone)]
pub struct ProcessRef {
    pub daemon: Arc<Daemon>,
    pub role: ProcessRole,
}

impl ProcessRef {
    pub fn process(&self) -> Option<&Process> {
        self.daemon.process(self.role)
    }
}

/// State guarded by the global lock.
#[derive(Debug)]
pub struct Context {
    pub(crate) phase: Phase,
    pub(crate) initialized: bool,
    pub(crate) daemons_started: bool,
    pub(crate) system_active: bool,
    pub(crate) low_priority_stop: LowPriorityStop,
    pub(crate) cluster: ClusterStatus,
    /// Requests admitted and not yet finished
    pub(crate) requests: usize,
    /// Live children, keyed by PID
    pub(crate) pids: HashMap<u32, ProcessRef>,
}

impl Context {
    fn new() -> Self {
        Self {
            phase: Phase::Boot,
            initialized: false,
            daemons_started: false,
            system_active: false,
            low_priority_stop: LowPriorityStop::NotPosted,
            cluster: ClusterStatus::default(),
            requests: 0,
            pids: HashMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finalizing(&self) -> bool {
        matches!(self.phase, Phase::Finalizing | Phase::Stopped)
    }

    /// Returns true if this call moved the phase into `Finalizing`.
    pub(crate) fn enter_finalizing(&mut self) -> bool {
        if self.is_finalizing() {
            return false;
        }
        self.phase = Phase::Finalizing;
        true
    }

    pub fn flags(&self) -> StateFlags {
        let mut bits = 0;
        if self.initialized {
            bits |= StateFlags::INITIALIZED;
        }
        if self.is_finalizing() {
            bits |= StateFlags::FINALIZING;
        }
        if self.daemons_started {
            bits |= StateFlags::DAEMONS_STARTED;
        }
        if self.system_active {
            bits |= StateFlags::CLUSTER_ACTIVE;
        }
        match self.low_priority_stop {
            LowPriorityStop::NotPosted => {}
            LowPriorityStop::Posted => bits |= StateFlags::LOW_PRIORITY_STOP_POSTED,
            LowPriorityStop::Done => {
                bits |= StateFlags::LOW_PRIORITY_STOP_POSTED | StateFlags::LOW_PRIORITY_STOP_DONE
            }
        }
        if self.cluster.is_transitioning() {
            bits |= StateFlags::TRANSITIONING;
        }
        StateFlags(bits)
    }
}

/// Liveness-probe view of the context, as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const INITIALIZED: u32 = 1 << 0;
    pub const FINALIZING: u32 = 1 << 1;
    pub const DAEMONS_STARTED: u32 = 1 << 2;
    pub const CLUSTER_ACTIVE: u32 = 1 << 3;
    pub const LOW_PRIORITY_STOP_POSTED: u32 = 1 << 4;
    pub const LOW_PRIORITY_STOP_DONE: u32 = 1 << 5;
    pub const TRANSITIONING: u32 = 1 << 6;

    const NAMES: [(u32, &'static str); 7] = [
        (Self::INITIALIZED, "initialized"),
        (Self::FINALIZING, "finalizing"),
        (Self::DAEMONS_STARTED, "daemons-started"),
        (Self::CLUSTER_ACTIVE, "cluster-active"),
        (Self::LOW_PRIORITY_STOP_POSTED, "low-priority-stop-posted"),
        (Self::LOW_PRIORITY_STOP_DONE, "low-priority-stop-done"),
        (Self::TRANSITIONING, "transitioning"),
    ];

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Held global lock. Per-process locks are only reachable through it.
pub struct Global<'a>(MutexGuard<'a, Context>);

impl Deref for Global<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.0
    }
}

impl DerefMut for Global<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        &mut self.0
    }
}

pub struct Supervisor {
    settings: Settings,
    registry: Arc<Registry>,
    context: Mutex<Context>,
    /// Signalled on context-wide changes: request drain, child drain, phase
    changed: Notify,
    launcher: Arc<dyn ProcessLauncher>,
    events: Arc<dyn EventSender>,
    exits: ExitSink,
    shutdown: ShutdownHandle,
}

impl Supervisor {
    /// Builds the supervisor and spawns the exit consumer. Must be called
    /// inside a tokio runtime.
    pub fn new(
        settings: Settings,
        registry: Registry,
        launcher: Arc<dyn ProcessLauncher>,
        events: Arc<dyn EventSender>,
        shutdown: ShutdownHandle,
    ) -> Arc<Self> {
        let (exits, rx) = ExitSink::channel();
        let supervisor = Arc::new(Self {
            settings,
            registry: Arc::new(registry),
            context: Mutex::new(Context::new()),
            changed: Notify::new(),
            launcher,
            events,
            exits,
            shutdown,
        });
        Self::spawn_exit_consumer(Arc::downgrade(&supervisor), rx);
        supervisor
    }

    /// Single consumer applying reaped exits in arrival order.
    fn spawn_exit_consumer(supervisor: Weak<Self>, mut rx: mpsc::UnboundedReceiver<ExitEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                supervisor.apply_exit(event);
            }
            debug!("Exit consumer stopped");
        });
    }

    pub(crate) fn lock(&self) -> Global<'_> {
        Global(self.context.lock().expect("supervisor lock poisoned"))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn launcher(&self) -> &dyn ProcessLauncher {
        self.launcher.as_ref()
    }

    pub(crate) fn event_sender(&self) -> &dyn EventSender {
        self.events.as_ref()
    }

    pub(crate) fn exits(&self) -> &ExitSink {
        &self.exits
    }

    pub(crate) fn context_changed(&self) -> &Notify {
        &self.changed
    }

    pub(crate) fn wake_context(&self) {
        self.changed.notify_waiters();
    }

    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.shutdown
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_finalizing(&self) -> bool {
        self.lock().is_finalizing()
    }

    /// The control surface is up.
    pub fn mark_initialized(&self) {
        self.lock().initialized = true;
        self.wake_context();
    }

    pub fn mark_stopped(&self) {
        self.lock().phase = Phase::Stopped;
        self.wake_context();
        info!("Supervisor stopped");
    }

    /// Enters finalization and wakes every waiter so blocked waits observe it.
    pub fn begin_finalizing(&self) -> bool {
        let entered = self.lock().enter_finalizing();
        if entered {
            info!("Supervisor finalizing");
            self.wake_all();
        }
        entered
    }

    pub(crate) fn wake_all(&self) {
        for daemon in self.registry.daemons() {
            daemon.primary().wake();
            if let Some(stop) = daemon.stop_process() {
                stop.wake();
            }
        }
        self.wake_context();
    }

    pub fn state_flags(&self) -> StateFlags {
        self.lock().flags()
    }

    /// No live PIDs and no exit event waiting to be applied.
    pub fn children_drained(&self) -> bool {
        let global = self.lock();
        global.pids.is_empty() && self.exits.in_flight() == 0
    }

    /// Current PID of a daemon's primary process.
    pub fn pid_of(&self, name: &str) -> Option<u32> {
        let daemon = self.registry.get(name)?;
        let global = self.lock();
        let pid = daemon.primary().lock(&global).pid;
        (pid != 0).then_some(pid)
    }

    pub fn live_pids(&self) -> Vec<(u32, String)> {
        let global = self.lock();
        let mut pids: Vec<_> = global
            .pids
            .iter()
            .map(|(pid, entry)| (*pid, entry.daemon.name().to_string()))
            .collect();
        pids.sort();
        pids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_reflect_context() {
        let mut ctx = Context::new();
        assert_eq!(ctx.flags(), StateFlags(0));

        ctx.initialized = true;
        ctx.daemons_started = true;
        ctx.low_priority_stop = LowPriorityStop::Done;
        let flags = ctx.flags();
        assert!(flags.contains(StateFlags::INITIALIZED));
        assert!(flags.contains(StateFlags::DAEMONS_STARTED));
        assert!(flags.contains(StateFlags::LOW_PRIORITY_STOP_POSTED));
        assert!(flags.contains(StateFlags::LOW_PRIORITY_STOP_DONE));
        assert!(!flags.contains(StateFlags::FINALIZING));
        assert_eq!(
            flags.names(),
            vec![
                "initialized",
                "daemons-started",
                "low-priority-stop-posted",
                "low-priority-stop-done"
            ]
        );
    }

    #[test]
    fn test_enter_finalizing_once() {
        let mut ctx = Context::new();
        assert!(ctx.enter_finalizing());
        assert!(!ctx.enter_finalizing());
        assert!(ctx.is_finalizing());
        ctx.phase = Phase::Stopped;
        assert!(ctx.is_finalizing());
    }
}
