use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clienv;

pub const SETTINGS_FILE: &str = "nodemgr.toml";
pub const DAEMONS_SUBDIR: &str = "daemons.d";

/// Supervisor-wide settings. Every field has a default so a missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Working directory handed to every daemon
    pub work_dir: PathBuf,
    /// Directory receiving per-daemon stderr logs
    pub log_dir: PathBuf,
    /// Local socket serving the control RPCs
    pub socket_path: PathBuf,
    /// Upper bound for the whole boot sequence
    pub boot_wait_ms: u64,
    /// Default deadline for a cluster transition
    pub cluster_event_wait_ms: u64,
    /// Default ready deadline for daemons without their own timeout
    pub daemon_start_wait_ms: u64,
    /// How long shutdown waits for in-flight requests
    pub request_drain_ms: u64,
    /// How long shutdown waits for every child to be reaped
    pub child_drain_ms: u64,
    /// Grace period between SIGABRT and SIGKILL escalation steps
    pub kill_grace_ms: u64,
    /// How long a transition request session waits before answering
    pub request_session_ms: u64,
    /// Daemons with a stop order above this are stopped by the deferred batch
    pub low_priority_stop_order: Option<i64>,
    /// Number of stderr lines in verbose status
    pub stderr_tail_lines: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = clienv::data_dir();
        Self {
            work_dir: data_dir.clone(),
            log_dir: data_dir.join("logs"),
            socket_path: data_dir.join("nodemgr.sock"),
            boot_wait_ms: 300_000,
            cluster_event_wait_ms: 60_000,
            daemon_start_wait_ms: 60_000,
            request_drain_ms: 10_000,
            child_drain_ms: 10_000,
            kill_grace_ms: 5_000,
            request_session_ms: 120_000,
            low_priority_stop_order: None,
            stderr_tail_lines: 20,
        }
    }
}

impl Settings {
    /// Loads `<config_dir>/nodemgr.toml`, then applies environment overrides
    /// (env > file > default).
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(SETTINGS_FILE);
        tracing::trace!(path = %path.display(), "Loading supervisor settings");

        let mut settings = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            toml::from_str::<Self>(&content)
                .with_context(|| format!("Failed to parse settings from {}", path.display()))?
        } else {
            tracing::trace!("Settings file does not exist, using defaults");
            Self::default()
        };

        if let Some(socket) = clienv::socket_override() {
            settings.socket_path = socket;
        }
        if let Some(dir) = clienv::log_dir_override() {
            settings.log_dir = dir;
        }
        if let Some(dir) = clienv::work_dir_override() {
            settings.work_dir = dir;
        }

        tracing::debug!(
            socket = %settings.socket_path.display(),
            log_dir = %settings.log_dir.display(),
            work_dir = %settings.work_dir.display(),
            "Supervisor settings loaded"
        );
        Ok(settings)
    }

    pub fn daemons_dir(config_dir: &Path) -> PathBuf {
        config_dir.join(DAEMONS_SUBDIR)
    }

    pub fn boot_wait(&self) -> Duration {
        Duration::from_millis(self.boot_wait_ms)
    }

    pub fn cluster_event_wait(&self) -> Duration {
        Duration::from_millis(self.cluster_event_wait_ms)
    }

    pub fn daemon_start_wait(&self) -> Duration {
        Duration::from_millis(self.daemon_start_wait_ms)
    }

    pub fn request_drain(&self) -> Duration {
        Duration::from_millis(self.request_drain_ms)
    }

    pub fn child_drain(&self) -> Duration {
        Duration::from_millis(self.child_drain_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn request_session(&self) -> Duration {
        Duration::from_millis(self.request_session_ms)
    }

    /// Settings rooted in one scratch directory, with short deadlines.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            work_dir: dir.to_path_buf(),
            log_dir: dir.join("logs"),
            socket_path: dir.join("nodemgr.sock"),
            boot_wait_ms: 5_000,
            cluster_event_wait_ms: 2_000,
            daemon_start_wait_ms: 2_000,
            request_drain_ms: 1_000,
            child_drain_ms: 1_000,
            kill_grace_ms: 200,
            request_session_ms: 5_000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.boot_wait_ms, 300_000);
        assert_eq!(settings.stderr_tail_lines, 20);
        assert!(settings.low_priority_stop_order.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "cluster_event_wait_ms = 1500\nlow_priority_stop_order = 100\n",
        )
        .unwrap();

        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.cluster_event_wait(), Duration::from_millis(1500));
        assert_eq!(settings.low_priority_stop_order, Some(100));
        assert_eq!(settings.kill_grace_ms, 5_000);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "boot_wait = 3\n").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }
}
