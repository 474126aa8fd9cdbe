//! nodemgr supervisor - boots, sequences and tears down a node's daemons
//!
//! Handles:
//! - Daemon registration from `daemons.d/*.toml` with start, stop and
//!   per-event order views
//! - Ordered boot with ready notifications, ordered and escalating shutdown
//! - Child exit tracking through a single exit consumer
//! - The cluster activation state machine and event delivery
//! - The control socket and its blocking client
//!
//! # Architecture
//!
//! One [`Supervisor`] object owns all state. Its global lock guards the
//! context; each process has its own lock that can only be taken while the
//! global one is held.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                nodemgr supervisor               │
//! ├────────────────────────────────────────────────┤
//! │  Sequencer  │  Cluster FSM  │  Control socket  │
//! │ (start/stop)│ (transitions) │  (requests)      │
//! ├────────────────────────────────────────────────┤
//! │  Registry → Daemon → Process ← exit consumer   │
//! ├────────────────────────────────────────────────┤
//! │  routed │ ifmgr │ syncd │ ...                   │
//! └────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod client;
pub mod cluster;
pub mod context;
pub mod launcher;
mod lifecycle;
pub mod process;
pub mod protocol;
pub mod registry;
mod requests;
pub mod sequencer;
#[cfg(unix)]
pub mod server;
pub mod shutdown;
pub mod stderr_log;
mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ClusterEvent, EventSender, SocketEventSender};
pub use client::DaemonClient;
pub use cluster::{ClusterState, EventType, NodeActivation};
pub use context::{Phase, StateFlags, Supervisor};
pub use launcher::{ProcessLauncher, Signal, TokioLauncher};
pub use process::ExitInfo;
pub use protocol::{Request, Response, TransitionOutcome};
pub use registry::{DaemonEntry, Registry};
pub use requests::RequestGuard;
pub use sequencer::{StopReport, Teardown};
#[cfg(unix)]
pub use server::SupervisorServer;
pub use shutdown::{ShutdownCoordinator, ShutdownHandle};
