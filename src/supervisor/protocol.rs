//! IPC Protocol types using rkyv for zero-copy serialization
//!
//! All request/response types use `#[derive(Archive, Serialize, Deserialize)]`.
//! One connection carries one framed request and one framed response.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

/// IPC request to the supervisor
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Check if the supervisor is alive
    Ping,
    /// Begin supervisor shutdown
    Shutdown,

    // Daemon → supervisor
    /// A start-wait daemon now accepts requests
    Ready {
        pid: u32,
        /// Local socket the daemon receives cluster events on
        channel: Option<String>,
    },
    /// Answer to the cluster event in flight
    Acknowledge { pid: u32, success: bool },

    // Queries
    /// Status of the named daemons (all when empty)
    Status { names: Vec<String> },
    /// Status plus stderr tail, start time and command line
    VerboseStatus { names: Vec<String> },
    /// Current cluster state and system-active flag
    NodeActivation,
    /// Supervisor state bitset
    StateFlags,

    // Cluster control
    /// Move the node to `event_type`
    Transition {
        event_type: String,
        /// Transition deadline; 0 uses the configured default
        timeout_secs: u32,
    },
    /// Leave the ERROR state after a failed transition
    ClearClusterError,
}

/// IPC response from the supervisor
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Response to Ping
    Pong {
        uptime_secs: u64,
        version: String,
        phase: String,
    },
    /// Generic success
    Ok,
    /// Error occurred
    Error { message: String },
    Status { entries: Vec<StatusEntry> },
    VerboseStatus { entries: Vec<VerboseEntry> },
    Transition {
        outcome: TransitionOutcome,
        message: Option<String>,
    },
    NodeActivation {
        event_type: String,
        stability: String,
        system_active: bool,
    },
    StateFlags { bits: u32 },
}

/// Result code of a transition request
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum TransitionOutcome {
    Ok,
    /// Unknown event type
    Invalid,
    /// Another transition is in progress
    Busy,
    /// A previous transition failed; clear the error first
    ErrorState,
    /// Already stable in the requested type
    Unchanged,
    Failed,
}

impl TransitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOutcome::Ok => "OK",
            TransitionOutcome::Invalid => "INVALID",
            TransitionOutcome::Busy => "BUSY",
            TransitionOutcome::ErrorState => "ERROR_STATE",
            TransitionOutcome::Unchanged => "UNCHANGED",
            TransitionOutcome::Failed => "FAILED",
        }
    }
}

/// Daemon status information
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct DaemonStatus {
    pub name: String,
    pub process_type: String,
    /// 0 when not running
    pub pid: u32,
    pub channel: Option<String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum StatusEntry {
    Found(DaemonStatus),
    Missing { name: String, message: String },
}

/// Verbose daemon status; unreadable fields are `None`
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct VerboseStatus {
    pub status: DaemonStatus,
    pub config_path: String,
    pub description: Option<String>,
    pub stderr_tail: Option<Vec<String>>,
    /// Unix seconds of the current run
    pub start_time: Option<u64>,
    pub argv: Vec<String>,
    /// Status code of the last exit, see `ExitInfo::status_code`
    pub last_exit: Option<i32>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum VerboseEntry {
    Found(VerboseStatus),
    Missing { name: String, message: String },
}

/// Cluster event as written to a daemon's control channel
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct ClusterEventMessage {
    pub event_type: String,
    pub system_active: bool,
    pub deadline_unix_ms: u64,
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    fn frame(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    /// rkyv needs the archive aligned; socket buffers are not.
    fn aligned(bytes: &[u8]) -> AlignedVec {
        let mut buf: AlignedVec = AlignedVec::with_capacity(bytes.len());
        buf.extend_from_slice(bytes);
        buf
    }

    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::frame(&bytes))
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::frame(&bytes))
    }

    pub fn encode_event(event: &ClusterEventMessage) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(event)?;
        Ok(Self::frame(&bytes))
    }

    /// Decode a request body (without length prefix)
    pub fn decode_request(body: &[u8]) -> Result<Request, rkyv::rancor::Error> {
        rkyv::from_bytes::<Request, rkyv::rancor::Error>(&Self::aligned(body))
    }

    pub fn decode_response(body: &[u8]) -> Result<Response, rkyv::rancor::Error> {
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(&Self::aligned(body))
    }

    pub fn decode_event(body: &[u8]) -> Result<ClusterEventMessage, rkyv::rancor::Error> {
        rkyv::from_bytes::<ClusterEventMessage, rkyv::rancor::Error>(&Self::aligned(body))
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }
}
