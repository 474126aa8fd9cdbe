//! Delivery of cluster events to daemons over their control channel.
//!
//! A daemon registers its channel (a local socket path) with its ready
//! notification. Delivery is fire-and-forget on the wire; the daemon answers
//! later through the supervisor's `Acknowledge` request.

use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

use super::cluster::EventType;
use super::protocol::{ClusterEventMessage, MessageFrame};
use super::registry::Daemon;
use crate::error::{Result, SupervisorError};

/// Payload sent to every daemon of an event view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterEvent {
    pub event_type: EventType,
    pub system_active: bool,
    /// Absolute deadline for the acknowledgement
    pub deadline: SystemTime,
}

impl ClusterEvent {
    pub fn to_message(&self) -> ClusterEventMessage {
        let deadline_unix_ms = self
            .deadline
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ClusterEventMessage {
            event_type: self.event_type.as_str().to_string(),
            system_active: self.system_active,
            deadline_unix_ms,
        }
    }
}

#[async_trait]
pub trait EventSender: Send + Sync {
    /// Hands `event` to `daemon`. Returning `Ok` means delivered, not acknowledged.
    async fn deliver(&self, daemon: &Daemon, channel: Option<&str>, event: &ClusterEvent) -> Result<()>;
}

/// Writes one framed [`ClusterEventMessage`] to the daemon's local socket.
#[derive(Debug, Default)]
pub struct SocketEventSender;

impl SocketEventSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSender for SocketEventSender {
    async fn deliver(&self, daemon: &Daemon, channel: Option<&str>, event: &ClusterEvent) -> Result<()> {
        let channel = channel.ok_or_else(|| SupervisorError::EventFailed {
            daemon: daemon.name().to_string(),
            event: event.event_type,
            reason: "no control channel registered".to_string(),
        })?;

        let frame = MessageFrame::encode_event(&event.to_message())
            .map_err(|e| SupervisorError::Protocol(e.to_string()))?;

        #[cfg(unix)]
        {
            use tokio::io::AsyncWriteExt;

            let mut stream = tokio::net::UnixStream::connect(channel).await?;
            stream.write_all(&frame).await?;
            stream.flush().await?;
            trace!("Sent {} to '{}' via {}", event.event_type, daemon.name(), channel);
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = frame;
            Err(SupervisorError::EventFailed {
                daemon: daemon.name().to_string(),
                event: event.event_type,
                reason: format!("channel {} unsupported on this platform", channel),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::registry::{DaemonEntry, Registry};
    use std::path::PathBuf;
    use std::time::Duration;

    fn registry() -> Registry {
        Registry::from_entries([(PathBuf::from("test.toml"), DaemonEntry::new("a", ["/bin/a"]))]).unwrap()
    }

    #[test]
    fn test_message_carries_deadline_in_ms() {
        let event = ClusterEvent {
            event_type: EventType::Standby,
            system_active: true,
            deadline: UNIX_EPOCH + Duration::from_millis(1_234),
        };
        let message = event.to_message();
        assert_eq!(message.event_type, "standby");
        assert!(message.system_active);
        assert_eq!(message.deadline_unix_ms, 1_234);
    }

    #[tokio::test]
    async fn test_missing_channel_fails() {
        let registry = registry();
        let daemon = registry.get("a").unwrap();
        let event = ClusterEvent {
            event_type: EventType::Active,
            system_active: false,
            deadline: SystemTime::now(),
        };
        let err = SocketEventSender::new().deliver(daemon, None, &event).await.unwrap_err();
        assert!(matches!(err, SupervisorError::EventFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_event_reaches_listening_daemon() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let registry = registry();
        let daemon = registry.get("a").unwrap();
        let event = ClusterEvent {
            event_type: EventType::Active,
            system_active: false,
            deadline: UNIX_EPOCH + Duration::from_secs(10),
        };

        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; MessageFrame::read_length(&len_buf)];
            stream.read_exact(&mut buf).await.unwrap();
            MessageFrame::decode_event(&buf).unwrap()
        });

        SocketEventSender::new()
            .deliver(daemon, path.to_str(), &event)
            .await
            .unwrap();

        let received = reader.await.unwrap();
        assert_eq!(received.event_type, "active");
        assert_eq!(received.deadline_unix_ms, 10_000);
    }
}
