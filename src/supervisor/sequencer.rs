//! Ordered boot and shutdown walks over the start and stop views.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::{LowPriorityStop, Phase, Supervisor};
use super::launcher::Signal;
use super::process::ExitInfo;
use super::registry::{Daemon, ViewKind};
use super::wait::wait_until;
use crate::error::{Result, SupervisorError};

/// Outcome of a stop pass.
#[derive(Debug, Default, Clone)]
pub struct StopReport {
    /// Daemons that stopped, with their observed exit
    pub stopped: Vec<(String, ExitInfo)>,
    /// Daemons whose graceful stop failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl StopReport {
    pub fn merge(&mut self, other: StopReport) {
        self.stopped.extend(other.stopped);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Shutdown in progress: the first pass has run, a deferred batch may still be stopping.
pub struct Teardown {
    first_pass: Result<StopReport>,
    deferred: Option<JoinHandle<Result<StopReport>>>,
}

impl Teardown {
    /// Waits for the deferred batch and merges both passes.
    pub async fn finish(self) -> Result<StopReport> {
        let mut report = self.first_pass?;
        if let Some(batch) = self.deferred {
            match batch.await {
                Ok(result) => report.merge(result?),
                Err(e) => error!("Low-priority stop task failed: {}", e),
            }
        }
        Ok(report)
    }
}

impl Supervisor {
    /// Starts every daemon in ascending start order, waiting for start-wait
    /// daemons to report ready. Daemons without a start order follow in name
    /// order. Already-started daemons are left running on failure.
    pub async fn start_all(&self) -> Result<()> {
        let settings = self.settings();
        let boot_deadline = Instant::now() + settings.boot_wait();

        let ordered = self
            .registry()
            .order_view(ViewKind::Start)
            .iter()
            .filter_map(|node| node.daemon().cloned());
        let unordered = self
            .registry()
            .daemons()
            .filter(|daemon| daemon.start_order().is_none())
            .cloned();
        let sequence: Vec<Arc<Daemon>> = ordered.chain(unordered).collect();

        info!("Starting {} daemon(s)", sequence.len());
        for daemon in &sequence {
            if self.is_finalizing() {
                return Err(SupervisorError::Cancelled);
            }

            debug!(order = ?daemon.start_order(), "Starting '{}'", daemon.name());
            self.start(daemon)?;

            if daemon.start_wait() {
                let wait = daemon.timeout().unwrap_or(settings.daemon_start_wait());
                let deadline = (Instant::now() + wait).min(boot_deadline);
                self.wait_ready(daemon, deadline).await?;
                debug!("'{}' is ready", daemon.name());
            }
        }

        {
            let mut global = self.lock();
            if global.is_finalizing() {
                return Err(SupervisorError::Cancelled);
            }
            global.daemons_started = true;
            global.phase = Phase::Running;
        }
        self.wake_context();
        info!("System ready: {} daemon(s) started", sequence.len());
        Ok(())
    }

    /// Enters finalization and stops every daemon with stop order ≤ `max_order`.
    ///
    /// With `None` every daemon is stopped, including those without a stop
    /// order, and the call then waits for all children to be reaped,
    /// escalating to SIGABRT and SIGKILL for stragglers.
    pub async fn stop_all(&self, max_order: Option<i64>) -> Result<StopReport> {
        self.begin_finalizing();

        let mut targets: Vec<Arc<Daemon>> = self
            .registry()
            .order_view(ViewKind::Stop)
            .up_to(max_order)
            .filter_map(|node| node.daemon().cloned())
            .collect();
        if max_order.is_none() {
            targets.extend(
                self.registry()
                    .daemons()
                    .filter(|daemon| daemon.stop_order().is_none())
                    .cloned(),
            );
        }

        match max_order {
            Some(max) => info!("Stopping {} daemon(s) up to order {}", targets.len(), max),
            None => info!("Stopping all {} daemon(s)", targets.len()),
        }

        let mut report = StopReport::default();
        for daemon in &targets {
            let wait = daemon.timeout().unwrap_or(self.settings().child_drain());
            match self.stop(daemon, Instant::now() + wait).await {
                Ok(Some(exit)) => report.stopped.push((daemon.name().to_string(), exit)),
                Ok(None) => debug!("'{}' was not running", daemon.name()),
                Err(e) => {
                    warn!("Failed to stop '{}': {}", daemon.name(), e);
                    report.failed.push((daemon.name().to_string(), e.to_string()));
                }
            }
        }

        if max_order.is_some() {
            return Ok(report);
        }

        let drained = self
            .wait_children_drained(Instant::now() + self.settings().child_drain())
            .await;
        if !drained {
            self.escalate().await;
        }

        let mut remaining: Vec<String> = self.live_pids().into_iter().map(|(_, name)| name).collect();
        remaining.sort();
        remaining.dedup();
        if !remaining.is_empty() {
            error!("Daemons did not confirm exit: {}", remaining.join(", "));
            return Err(SupervisorError::StopFailed(remaining));
        }

        if !report.is_clean() {
            warn!("{} daemon(s) did not stop gracefully", report.failed.len());
        }
        Ok(report)
    }

    async fn wait_children_drained(&self, deadline: Instant) -> bool {
        wait_until(self.context_changed(), deadline, || {
            self.children_drained().then_some(())
        })
        .await
        .is_some()
    }

    /// SIGABRT to everything left, then SIGKILL, each followed by a grace period.
    async fn escalate(&self) {
        for signal in [Signal::Abrt, Signal::Kill] {
            let live = self.live_pids();
            if live.is_empty() {
                return;
            }
            for (pid, name) in &live {
                warn!("Sending {} to '{}' (PID {})", signal, name, pid);
                if let Err(e) = self.launcher().signal(*pid, signal) {
                    debug!("Failed to send {} to PID {}: {}", signal, pid, e);
                }
            }
            if self
                .wait_children_drained(Instant::now() + self.settings().kill_grace())
                .await
            {
                return;
            }
        }
    }

    /// Stops the remaining low-priority daemons on a separate task.
    pub fn post_low_priority_stop(self: &Arc<Self>) -> JoinHandle<Result<StopReport>> {
        self.lock().low_priority_stop = LowPriorityStop::Posted;
        self.wake_context();
        info!("Posted low-priority stop batch");

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let result = supervisor.stop_all(None).await;
            supervisor.lock().low_priority_stop = LowPriorityStop::Done;
            supervisor.wake_context();
            debug!("Low-priority stop batch done");
            result
        })
    }

    /// First half of shutdown: finalize, drain requests, stop up to the
    /// low-priority cutoff and post the deferred batch.
    pub async fn begin_teardown(self: &Arc<Self>) -> Teardown {
        self.begin_finalizing();

        let drain_deadline = Instant::now() + self.settings().request_drain();
        if let Err(e) = self.finalize_requests(drain_deadline).await {
            warn!("Proceeding with shutdown: {}", e);
        }

        match self.settings().low_priority_stop_order {
            Some(cutoff) => {
                let first_pass = self.stop_all(Some(cutoff)).await;
                let deferred = self.post_low_priority_stop();
                Teardown {
                    first_pass,
                    deferred: Some(deferred),
                }
            }
            None => Teardown {
                first_pass: self.stop_all(None).await,
                deferred: None,
            },
        }
    }
}
