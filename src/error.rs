use std::path::PathBuf;
use thiserror::Error;

use crate::supervisor::cluster::EventType;

#[derive(Error, Debug)]
pub enum SupervisorError {
    // Configuration errors: fatal at boot.
    #[error("invalid configuration in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("daemon '{0}' is defined more than once")]
    DuplicateDaemon(String),

    #[error("{view} order {order} of daemon '{daemon}' is already taken by '{existing}'")]
    DuplicateOrder {
        view: String,
        order: i64,
        daemon: String,
        existing: String,
    },

    #[error("{view} order {order} of daemon '{daemon}' is reserved")]
    ReservedOrder {
        view: String,
        order: i64,
        daemon: String,
    },

    #[error("daemon '{daemon}' has an invalid stop signal '{signal}'")]
    InvalidSignal { daemon: String, signal: String },

    #[error("unknown cluster event type '{0}'")]
    UnknownEventType(String),

    #[error("unknown daemon '{0}'")]
    UnknownDaemon(String),

    // Transient and cancellation errors.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("operation cancelled: supervisor is finalizing")]
    Cancelled,

    #[error("supervisor is still starting")]
    Starting,

    // Process identity errors.
    #[error("no process with PID {0}")]
    UnknownPid(u32),

    #[error("request claims PID {claimed} but peer is PID {peer}")]
    PidMismatch { claimed: u32, peer: u32 },

    #[error("PID {pid} ({daemon}) is not awaiting a ready notification")]
    NotAwaitingReady { pid: u32, daemon: String },

    #[error("PID {pid} ({daemon}) has no cluster event in flight")]
    NoEventInFlight { pid: u32, daemon: String },

    // Process lifecycle errors.
    #[error("daemon '{daemon}' is already running with PID {pid}")]
    AlreadyRunning { daemon: String, pid: u32 },

    #[error("failed to launch daemon '{daemon}': {source}")]
    Launch {
        daemon: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal daemon '{daemon}': {source}")]
    Signal {
        daemon: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stop command of daemon '{daemon}' failed: {reason}")]
    StopCommand { daemon: String, reason: String },

    #[error("daemon '{0}' died")]
    DaemonDied(String),

    #[error("daemons did not confirm exit: {}", .0.join(", "))]
    StopFailed(Vec<String>),

    // Cluster state machine rejections.
    #[error("a cluster transition is already in progress")]
    Busy,

    #[error("cluster is in ERROR state after a failed transition to {0}")]
    ErrorState(EventType),

    #[error("cluster is already stable in {0}")]
    Unchanged(EventType),

    #[error("cluster is not in ERROR state")]
    NotInError,

    #[error("delivering {event} to daemon '{daemon}' failed: {reason}")]
    EventFailed {
        daemon: String,
        event: EventType,
        reason: String,
    },

    #[error("daemon '{daemon}' rejected cluster event {event}")]
    EventRejected { daemon: String, event: EventType },

    // Transport errors.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("supervisor replied: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Whether the error came from a blocking wait that was cut short by finalization.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
