use std::path::PathBuf;

pub const CONFIG_DIR_ENV: &str = "NODEMGR_CONFIG_DIR";
pub const SOCKET_ENV: &str = "NODEMGR_SOCKET";
pub const LOG_DIR_ENV: &str = "NODEMGR_LOG_DIR";
pub const WORK_DIR_ENV: &str = "NODEMGR_WORK_DIR";
/// Exported to every supervised daemon so it knows its own record name.
pub const DAEMON_NAME_ENV: &str = "NODEMGR_DAEMON";

const SYSTEM_CONFIG_DIR: &str = "/etc/nodemgr";
const NODEMGR_SUBDIR: &str = "nodemgr";

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Config directory ($NODEMGR_CONFIG_DIR or /etc/nodemgr)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_DIR));
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Data directory (~/.local/share/nodemgr)
pub fn data_dir() -> PathBuf {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join(NODEMGR_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Optional supervisor socket override ($NODEMGR_SOCKET)
pub fn socket_override() -> Option<PathBuf> {
    let val = env_opt(SOCKET_ENV).map(PathBuf::from);
    tracing::trace!(value = ?val, "NODEMGR_SOCKET env var");
    val
}

/// Optional log directory override ($NODEMGR_LOG_DIR)
pub fn log_dir_override() -> Option<PathBuf> {
    let val = env_opt(LOG_DIR_ENV).map(PathBuf::from);
    tracing::trace!(value = ?val, "NODEMGR_LOG_DIR env var");
    val
}

/// Optional working directory override ($NODEMGR_WORK_DIR)
pub fn work_dir_override() -> Option<PathBuf> {
    let val = env_opt(WORK_DIR_ENV).map(PathBuf::from);
    tracing::trace!(value = ?val, "NODEMGR_WORK_DIR env var");
    val
}

/// Supervisor socket path ($NODEMGR_SOCKET or ~/.local/share/nodemgr/nodemgr.sock)
pub fn socket_path() -> PathBuf {
    socket_override().unwrap_or_else(|| data_dir().join("nodemgr.sock"))
}

