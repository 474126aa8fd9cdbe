mod args;
mod commands;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use nodemgr::clienv;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config_dir = cli.config_dir.unwrap_or_else(clienv::config_dir);

    match cli.command {
        Commands::Run => commands::run::cmd_run(&config_dir).await?,
        Commands::Status {
            names,
            verbose,
            json,
        } => commands::control::cmd_status(&config_dir, &names, verbose, json)?,
        Commands::Transition {
            event_type,
            timeout,
        } => commands::control::cmd_transition(&config_dir, &event_type, timeout)?,
        Commands::Activation => commands::control::cmd_activation(&config_dir)?,
        Commands::Flags => commands::control::cmd_flags(&config_dir)?,
        Commands::ClearError => commands::control::cmd_clear_error(&config_dir)?,
        Commands::Ready { pid, channel } => commands::control::cmd_ready(&config_dir, pid, channel)?,
        Commands::Ack { pid, failed } => commands::control::cmd_ack(&config_dir, pid, !failed)?,
        Commands::Ping => commands::control::cmd_ping(&config_dir)?,
        Commands::Shutdown => commands::control::cmd_shutdown(&config_dir)?,
    }

    Ok(())
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    Ok(())
}
