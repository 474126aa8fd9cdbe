use anyhow::{Context, Result};
use nodemgr::supervisor::{
    Registry, ShutdownCoordinator, SocketEventSender, Supervisor, SupervisorServer, TokioLauncher,
};
use nodemgr::Settings;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn cmd_run(config_dir: &Path) -> Result<()> {
    let settings = Settings::load(config_dir)?;
    let daemons_dir = Settings::daemons_dir(config_dir);
    let registry = Registry::load(&daemons_dir)
        .with_context(|| format!("Failed to load daemon definitions from {}", daemons_dir.display()))?;

    println!("Running supervisor in foreground (Ctrl+C to stop)");
    println!("  Config:  {}", config_dir.display());
    println!("  Socket:  {}", settings.socket_path.display());
    println!("  Logs:    {}", settings.log_dir.display());
    println!("  Daemons: {}", registry.len());
    println!();

    let shutdown = ShutdownCoordinator::new();
    let supervisor = Supervisor::new(
        settings,
        registry,
        Arc::new(TokioLauncher::new()),
        Arc::new(SocketEventSender::new()),
        shutdown.handle(),
    );

    let report = SupervisorServer::new(supervisor).run(shutdown).await?;
    info!(
        stopped = report.stopped.len(),
        failed = report.failed.len(),
        "Shutdown complete"
    );
    if !report.is_clean() {
        anyhow::bail!("{} daemon(s) did not stop gracefully", report.failed.len());
    }
    Ok(())
}
