//! Blocking client for the supervisor's control socket.
//!
//! Used by the CLI and by supervised daemons that report readiness or
//! acknowledge cluster events.

use interprocess::local_socket::{prelude::*, GenericFilePath, Stream};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::context::StateFlags;
use super::protocol::{MessageFrame, Request, Response, StatusEntry, TransitionOutcome, VerboseEntry};
use crate::clienv;
use crate::error::{Result, SupervisorError};

/// Supervisor liveness as reported by `Ping`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingInfo {
    pub uptime_secs: u64,
    pub version: String,
    pub phase: String,
}

/// Node activation as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationInfo {
    pub event_type: String,
    pub stability: String,
    pub system_active: bool,
}

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new() -> Self {
        Self::with_socket(clienv::socket_path())
    }

    pub fn with_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends one request and reads its response.
    pub fn request(&self, request: &Request) -> Result<Response> {
        let name = self.socket_path.as_path().to_fs_name::<GenericFilePath>()?;
        let mut stream = Stream::connect(name)?;

        let frame = MessageFrame::encode_request(request).map_err(|e| SupervisorError::Protocol(e.to_string()))?;
        stream.write_all(&frame)?;
        stream.flush()?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let mut body = vec![0u8; MessageFrame::read_length(&len_buf)];
        stream.read_exact(&mut body)?;

        MessageFrame::decode_response(&body).map_err(|e| SupervisorError::Protocol(e.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.ping().is_ok()
    }

    pub fn ping(&self) -> Result<PingInfo> {
        match self.request(&Request::Ping)? {
            Response::Pong {
                uptime_secs,
                version,
                phase,
            } => Ok(PingInfo {
                uptime_secs,
                version,
                phase,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        expect_ok(self.request(&Request::Shutdown)?)
    }

    pub fn ready(&self, pid: u32, channel: Option<String>) -> Result<()> {
        expect_ok(self.request(&Request::Ready { pid, channel })?)
    }

    pub fn acknowledge(&self, pid: u32, success: bool) -> Result<()> {
        expect_ok(self.request(&Request::Acknowledge { pid, success })?)
    }

    pub fn status(&self, names: &[String]) -> Result<Vec<StatusEntry>> {
        match self.request(&Request::Status {
            names: names.to_vec(),
        })? {
            Response::Status { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub fn verbose_status(&self, names: &[String]) -> Result<Vec<VerboseEntry>> {
        match self.request(&Request::VerboseStatus {
            names: names.to_vec(),
        })? {
            Response::VerboseStatus { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// Requests a transition; `timeout_secs == 0` uses the supervisor default.
    pub fn transition(&self, event_type: &str, timeout_secs: u32) -> Result<(TransitionOutcome, Option<String>)> {
        match self.request(&Request::Transition {
            event_type: event_type.to_string(),
            timeout_secs,
        })? {
            Response::Transition { outcome, message } => Ok((outcome, message)),
            other => Err(unexpected(other)),
        }
    }

    pub fn node_activation(&self) -> Result<ActivationInfo> {
        match self.request(&Request::NodeActivation)? {
            Response::NodeActivation {
                event_type,
                stability,
                system_active,
            } => Ok(ActivationInfo {
                event_type,
                stability,
                system_active,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn state_flags(&self) -> Result<StateFlags> {
        match self.request(&Request::StateFlags)? {
            Response::StateFlags { bits } => Ok(StateFlags(bits)),
            other => Err(unexpected(other)),
        }
    }

    pub fn clear_cluster_error(&self) -> Result<()> {
        expect_ok(self.request(&Request::ClearClusterError)?)
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_ok(response: Response) -> Result<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> SupervisorError {
    match response {
        Response::Error { message } => SupervisorError::Remote(message),
        other => SupervisorError::Protocol(format!("unexpected response: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_maps_to_remote() {
        let err = expect_ok(Response::Error {
            message: "unknown daemon 'x'".into(),
        })
        .unwrap_err();
        assert!(matches!(err, SupervisorError::Remote(ref m) if m == "unknown daemon 'x'"));
    }

    #[test]
    fn test_mismatched_response_is_protocol_error() {
        let err = expect_ok(Response::StateFlags { bits: 1 }).unwrap_err();
        assert!(matches!(err, SupervisorError::Protocol(_)));
    }

    #[test]
    fn test_missing_socket_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::with_socket(dir.path().join("absent.sock"));
        assert!(!client.is_running());
        assert!(matches!(client.state_flags(), Err(SupervisorError::Io(_))));
    }
}
