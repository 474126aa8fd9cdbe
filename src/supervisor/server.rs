use super::cluster::EventType;
use super::context::Supervisor;
use super::protocol::{MessageFrame, Request, Response, TransitionOutcome};
use super::sequencer::StopReport;
use super::shutdown::ShutdownCoordinator;
use crate::error::SupervisorError;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tracing::{debug, error, info, trace, warn};

/// Largest request body accepted from a client.
const MAX_FRAME: usize = 1 << 20;

/// Control socket in front of a [`Supervisor`]; owns boot and teardown.
pub struct SupervisorServer {
    supervisor: Arc<Supervisor>,
    started_at: Instant,
    version: String,
}

impl SupervisorServer {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Serves requests, boots every daemon and, once shutdown is requested,
    /// runs the teardown sequence.
    pub async fn run(self, mut shutdown: ShutdownCoordinator) -> Result<StopReport> {
        info!("nodemgr starting...");
        let socket_path = self.supervisor.settings().socket_path.clone();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = tokio::net::UnixListener::bind(&socket_path)?;
        info!("Control socket listening on: {}", socket_path.display());

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }
        self.supervisor.mark_initialized();

        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let handle = shutdown.handle();

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => handle.shutdown("received SIGTERM"),
                    _ = sigint.recv() => handle.shutdown("received SIGINT"),
                }
            });
        }

        let boot = {
            let supervisor = Arc::clone(&self.supervisor);
            let handle = shutdown.handle();
            tokio::spawn(async move {
                match supervisor.start_all().await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => debug!("Boot cancelled by shutdown"),
                    Err(e) => {
                        error!("Boot failed: {}", e);
                        handle.shutdown("boot failed");
                    }
                }
            })
        };

        let server = Arc::new(self);

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let teardown = server.supervisor.begin_teardown().await;

        drop(listener);
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let result = teardown.finish().await;
        if let Err(e) = boot.await {
            warn!("Boot task ended abnormally: {}", e);
        }
        server.supervisor.mark_stopped();

        let report = result?;
        for (name, reason) in &report.failed {
            warn!("'{}' did not stop gracefully: {}", name, reason);
        }
        info!("nodemgr stopped");
        Ok(report)
    }

    async fn handle_connection(&self, mut stream: tokio::net::UnixStream) -> Result<()> {
        trace!("New connection accepted");
        let peer_pid = stream
            .peer_cred()
            .ok()
            .and_then(|cred| cred.pid())
            .and_then(|pid| u32::try_from(pid).ok());

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = MessageFrame::read_length(&len_buf);
        trace!("Request length: {} bytes", len);
        if len > MAX_FRAME {
            anyhow::bail!("Request of {} bytes exceeds limit", len);
        }

        let mut request_buf = vec![0u8; len];
        stream.read_exact(&mut request_buf).await?;

        let request = MessageFrame::decode_request(&request_buf)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

        let response = self.handle_request(request, peer_pid).await;

        let response_bytes = MessageFrame::encode_response(&response)
            .map_err(|e| anyhow::anyhow!("Failed to encode response: {}", e))?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        trace!("Response sent");
        Ok(())
    }

    pub async fn handle_request(&self, request: Request, peer_pid: Option<u32>) -> Response {
        let supervisor = &self.supervisor;

        // Liveness probes and shutdown bypass request admission.
        match request {
            Request::Ping => {
                debug!("Handling: Ping");
                return Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                    phase: supervisor.phase().as_str().to_string(),
                };
            }
            Request::StateFlags => {
                return Response::StateFlags {
                    bits: supervisor.state_flags().0,
                };
            }
            Request::Shutdown => {
                info!("Handling: Shutdown");
                supervisor.shutdown_handle().shutdown("requested over control socket");
                return Response::Ok;
            }
            _ => {}
        }

        let _guard = match supervisor.admit() {
            Ok(guard) => guard,
            Err(e) => return error_response(e),
        };

        match request {
            Request::Ready { pid, channel } => {
                debug!("Handling: Ready({}, {:?})", pid, channel);
                let result = verify_peer(pid, peer_pid).and_then(|()| supervisor.notify_ready(pid, channel));
                ok_or_error(result)
            }

            Request::Acknowledge { pid, success } => {
                debug!("Handling: Acknowledge({}, success: {})", pid, success);
                let result = verify_peer(pid, peer_pid).and_then(|()| supervisor.acknowledge(pid, success));
                ok_or_error(result)
            }

            Request::Status { names } => {
                debug!("Handling: Status({:?})", names);
                match supervisor.status(&names) {
                    Ok(entries) => Response::Status { entries },
                    Err(e) => error_response(e),
                }
            }

            Request::VerboseStatus { names } => {
                debug!("Handling: VerboseStatus({:?})", names);
                match supervisor.verbose_status(&names) {
                    Ok(entries) => Response::VerboseStatus { entries },
                    Err(e) => error_response(e),
                }
            }

            Request::NodeActivation => {
                let activation = supervisor.node_activation();
                Response::NodeActivation {
                    event_type: activation.state.event_type().as_str().to_string(),
                    stability: activation.state.stability().to_string(),
                    system_active: activation.system_active,
                }
            }

            Request::Transition {
                event_type,
                timeout_secs,
            } => {
                info!("Handling: Transition({}, timeout: {}s)", event_type, timeout_secs);
                self.transition(&event_type, timeout_secs).await
            }

            Request::ClearClusterError => {
                info!("Handling: ClearClusterError");
                ok_or_error(supervisor.clear_cluster_error().map(|_| ()))
            }

            Request::Ping | Request::StateFlags | Request::Shutdown => Response::Ok,
        }
    }

    /// Runs the transition on its own task so a session timeout answers the
    /// caller without aborting the transition.
    async fn transition(&self, event_type: &str, timeout_secs: u32) -> Response {
        let to = match event_type.parse::<EventType>() {
            Ok(to) => to,
            Err(e) => {
                return Response::Transition {
                    outcome: TransitionOutcome::Invalid,
                    message: Some(e.to_string()),
                }
            }
        };

        let settings = self.supervisor.settings();
        let timeout = match timeout_secs {
            0 => settings.cluster_event_wait(),
            secs => Duration::from_secs(secs.into()),
        };

        let supervisor = Arc::clone(&self.supervisor);
        let task = tokio::spawn(async move { supervisor.request_transition(to, timeout).await });

        match tokio::time::timeout(settings.request_session(), task).await {
            Ok(Ok(Ok(()))) => Response::Transition {
                outcome: TransitionOutcome::Ok,
                message: None,
            },
            Ok(Ok(Err(e))) => Response::Transition {
                outcome: outcome_for(&e),
                message: Some(e.to_string()),
            },
            Ok(Err(e)) => Response::Transition {
                outcome: TransitionOutcome::Failed,
                message: Some(format!("transition task failed: {}", e)),
            },
            Err(_) => Response::Transition {
                outcome: TransitionOutcome::Failed,
                message: Some("request session timed out; transition still running".to_string()),
            },
        }
    }
}

fn outcome_for(error: &SupervisorError) -> TransitionOutcome {
    match error {
        SupervisorError::UnknownEventType(_) => TransitionOutcome::Invalid,
        SupervisorError::Busy => TransitionOutcome::Busy,
        SupervisorError::ErrorState(_) => TransitionOutcome::ErrorState,
        SupervisorError::Unchanged(_) => TransitionOutcome::Unchanged,
        _ => TransitionOutcome::Failed,
    }
}

fn ok_or_error(result: crate::error::Result<()>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => error_response(e),
    }
}

fn error_response(error: SupervisorError) -> Response {
    Response::Error {
        message: error.to_string(),
    }
}

/// The claimed PID must be the connecting process or its parent (a daemon
/// shelling out to `nodemgr ready`).
fn verify_peer(claimed: u32, peer: Option<u32>) -> crate::error::Result<()> {
    let Some(peer) = peer else {
        trace!("Peer credentials unavailable, trusting process table");
        return Ok(());
    };
    if peer == claimed || parent_pid(peer) == Some(claimed) {
        return Ok(());
    }
    warn!("Request claims PID {} but comes from PID {}", claimed, peer);
    Err(SupervisorError::PidMismatch { claimed, peer })
}

#[cfg(target_os = "linux")]
fn parent_pid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields after the parenthesised command name: state, ppid, ...
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn parent_pid(_pid: u32) -> Option<u32> {
    None
}
