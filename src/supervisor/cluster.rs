//! Cluster activation state machine.
//!
//! One node-wide state, changed by a two-phase transition: begin, notify every
//! node of the target event view in ascending order (one at a time, each
//! acknowledged before the next is contacted), then commit. The first failure
//! aborts the transition into `ERROR` and nobody downstream hears about it.
//!
//! ```text
//!   STABLE(a) ──request(b)──► TRANSITIONING(a→b) ──all acked──► STABLE(b)
//!                                     │
//!                                     └──fail/timeout──► ERROR(b) ──clear──► STABLE(a)
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel::ClusterEvent;
use super::context::Supervisor;
use super::process::{EventDelivery, ProcessRole};
use super::registry::{Daemon, NodeTarget, ViewKind};
use super::wait::{before, wait_until};
use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    Initial,
    Active,
    Standby,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::Initial, EventType::Active, EventType::Standby];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Initial => "initial",
            EventType::Active => "active",
            EventType::Standby => "standby",
        }
    }
}

impl FromStr for EventType {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initial" => Ok(EventType::Initial),
            "active" => Ok(EventType::Active),
            "standby" => Ok(EventType::Standby),
            _ => Err(SupervisorError::UnknownEventType(s.to_string())),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Stable(EventType),
    Transitioning { from: EventType, to: EventType },
    Error(EventType),
}

impl ClusterState {
    /// The event type the state is about: current, target, or failed target.
    pub fn event_type(&self) -> EventType {
        match *self {
            ClusterState::Stable(event) => event,
            ClusterState::Transitioning { to, .. } => to,
            ClusterState::Error(event) => event,
        }
    }

    pub fn stability(&self) -> &'static str {
        match self {
            ClusterState::Stable(_) => "STABLE",
            ClusterState::Transitioning { .. } => "TRANSITIONING",
            ClusterState::Error(_) => "ERROR",
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.stability(), self.event_type())
    }
}

/// Cluster state plus bookkeeping, kept under the global lock.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    state: ClusterState,
    /// Last successfully committed event type
    committed: EventType,
    started_at: Option<SystemTime>,
    finished_at: Option<SystemTime>,
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self {
            state: ClusterState::Stable(EventType::Initial),
            committed: EventType::Initial,
            started_at: None,
            finished_at: None,
        }
    }
}

impl ClusterStatus {
    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn committed(&self) -> EventType {
        self.committed
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<SystemTime> {
        self.finished_at
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self.state, ClusterState::Transitioning { .. })
    }

    /// Enters `TRANSITIONING(to)` or explains why not.
    pub(crate) fn begin(&mut self, to: EventType) -> Result<EventType> {
        match self.state {
            ClusterState::Transitioning { .. } => Err(SupervisorError::Busy),
            ClusterState::Error(failed) => Err(SupervisorError::ErrorState(failed)),
            ClusterState::Stable(current) if current == to => Err(SupervisorError::Unchanged(current)),
            ClusterState::Stable(current) => {
                self.state = ClusterState::Transitioning { from: current, to };
                self.started_at = Some(SystemTime::now());
                self.finished_at = None;
                Ok(current)
            }
        }
    }

    pub(crate) fn commit(&mut self, to: EventType) {
        self.state = ClusterState::Stable(to);
        self.committed = to;
        self.finished_at = Some(SystemTime::now());
    }

    pub(crate) fn fail(&mut self, to: EventType) {
        self.state = ClusterState::Error(to);
        self.finished_at = Some(SystemTime::now());
    }

    /// `ERROR(t)` → `STABLE(last committed)`.
    pub(crate) fn clear_error(&mut self) -> Result<EventType> {
        match self.state {
            ClusterState::Error(_) => {
                self.state = ClusterState::Stable(self.committed);
                Ok(self.committed)
            }
            _ => Err(SupervisorError::NotInError),
        }
    }
}

/// Answer to a node-activation query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeActivation {
    pub state: ClusterState,
    pub system_active: bool,
}

impl Supervisor {
    /// Runs one cluster transition to `to`, giving every daemon until
    /// `timeout` from now to acknowledge.
    pub async fn request_transition(&self, to: EventType, timeout: Duration) -> Result<()> {
        let from = {
            let mut global = self.lock();
            if global.is_finalizing() {
                return Err(SupervisorError::Cancelled);
            }
            global.cluster.begin(to)?
        };
        info!("Cluster transition {} -> {} started", from, to);

        let deadline = Instant::now() + timeout;
        let wall_deadline = SystemTime::now() + timeout;

        for node in self.registry().order_view(ViewKind::Event(to)).iter() {
            let result = match node.target {
                NodeTarget::Daemon(ref daemon) => {
                    debug!(order = node.order, event = %to, "Notifying '{}'", daemon.name());
                    self.deliver_event(daemon, to, deadline, wall_deadline).await
                }
                NodeTarget::Supervisor => {
                    self.apply_local_event(to);
                    Ok(())
                }
            };

            if let Err(e) = result {
                self.lock().cluster.fail(to);
                self.wake_context();
                warn!("Cluster transition {} -> {} failed: {}", from, to, e);
                return Err(e);
            }
        }

        self.lock().cluster.commit(to);
        self.wake_context();
        info!("Cluster transition {} -> {} committed", from, to);
        Ok(())
    }

    /// Node-local part of a transition, run by the supervisor's own always-last entry.
    fn apply_local_event(&self, event: EventType) {
        let mut global = self.lock();
        global.system_active = event == EventType::Active;
        debug!(event = %event, system_active = global.system_active, "Applied node-local cluster state");
    }

    async fn deliver_event(
        &self,
        daemon: &Arc<Daemon>,
        event: EventType,
        deadline: Instant,
        wall_deadline: SystemTime,
    ) -> Result<()> {
        let process = daemon.primary();
        let (channel, system_active) = {
            let global = self.lock();
            if global.is_finalizing() {
                return Err(SupervisorError::Cancelled);
            }
            let system_active = global.system_active;
            let mut state = process.lock(&global);
            if !state.is_running() {
                return Err(SupervisorError::DaemonDied(daemon.name().to_string()));
            }
            state.event = EventDelivery::InFlight;
            (state.channel.clone(), system_active)
        };

        let payload = ClusterEvent {
            event_type: event,
            system_active,
            deadline: wall_deadline,
        };

        let sent = before(
            deadline,
            self.event_sender().deliver(daemon, channel.as_deref(), &payload),
        )
        .await
        .unwrap_or_else(|| Err(SupervisorError::Timeout(format!("delivery to '{}'", daemon.name()))));

        if let Err(e) = sent {
            self.reset_event(daemon);
            return Err(match e {
                SupervisorError::EventFailed { .. } | SupervisorError::Timeout(_) => e,
                other => SupervisorError::EventFailed {
                    daemon: daemon.name().to_string(),
                    event,
                    reason: other.to_string(),
                },
            });
        }

        let outcome = wait_until(process.changed(), deadline, || {
            let global = self.lock();
            let finalizing = global.is_finalizing();
            let mut state = process.lock(&global);
            if finalizing {
                return Some(Err(SupervisorError::Cancelled));
            }
            if !state.is_running() {
                return Some(Err(SupervisorError::DaemonDied(daemon.name().to_string())));
            }
            match state.event {
                EventDelivery::Acknowledged => {
                    state.event = EventDelivery::Idle;
                    Some(Ok(()))
                }
                EventDelivery::Rejected => {
                    state.event = EventDelivery::Idle;
                    Some(Err(SupervisorError::EventRejected {
                        daemon: daemon.name().to_string(),
                        event,
                    }))
                }
                EventDelivery::InFlight | EventDelivery::Idle => None,
            }
        })
        .await;

        match outcome {
            Some(Ok(())) => {
                debug!(event = %event, "'{}' acknowledged", daemon.name());
                Ok(())
            }
            Some(Err(e)) => {
                self.reset_event(daemon);
                Err(e)
            }
            None => {
                self.reset_event(daemon);
                Err(SupervisorError::Timeout(format!(
                    "'{}' to acknowledge {}",
                    daemon.name(),
                    event
                )))
            }
        }
    }

    fn reset_event(&self, daemon: &Daemon) {
        let global = self.lock();
        daemon.primary().lock(&global).event = EventDelivery::Idle;
    }

    /// Records a daemon's answer to the cluster event in flight for `pid`.
    pub fn acknowledge(&self, pid: u32, success: bool) -> Result<()> {
        let global = self.lock();
        let entry = global.pids.get(&pid).ok_or_else(|| {
            warn!("Acknowledgement from unknown PID {}", pid);
            SupervisorError::UnknownPid(pid)
        })?;
        let daemon = Arc::clone(&entry.daemon);
        let role = entry.role;

        let process = daemon.primary();
        {
            let mut state = process.lock(&global);
            if role != ProcessRole::Primary || state.event != EventDelivery::InFlight {
                warn!("Unexpected acknowledgement from '{}' (PID {})", daemon.name(), pid);
                return Err(SupervisorError::NoEventInFlight {
                    pid,
                    daemon: daemon.name().to_string(),
                });
            }
            state.event = if success {
                EventDelivery::Acknowledged
            } else {
                EventDelivery::Rejected
            };
        }
        drop(global);

        debug!(success, "'{}' (PID {}) answered cluster event", daemon.name(), pid);
        process.wake();
        Ok(())
    }

    /// Moves `ERROR(t)` back to the last committed stable state.
    pub fn clear_cluster_error(&self) -> Result<EventType> {
        let restored = self.lock().cluster.clear_error()?;
        self.wake_context();
        info!("Cluster error cleared, back to STABLE({})", restored);
        Ok(restored)
    }

    pub fn cluster_state(&self) -> ClusterState {
        self.lock().cluster.state()
    }

    pub fn node_activation(&self) -> NodeActivation {
        let global = self.lock();
        NodeActivation {
            state: global.cluster.state(),
            system_active: global.system_active,
        }
    }
}
