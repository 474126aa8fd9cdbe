use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nodemgr")]
#[command(version)]
#[command(about = "Supervisor for the daemons of a network-control node", long_about = None)]
pub(crate) struct Cli {
    /// Configuration directory. Can also be set via NODEMGR_CONFIG_DIR env var.
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the supervisor in the foreground
    Run,

    /// Show daemon status
    Status {
        /// Daemon names (all daemons if omitted)
        names: Vec<String>,

        /// Include stderr tail, start time and command line
        #[arg(short, long)]
        verbose: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Request a cluster transition
    Transition {
        /// Target event type (initial, active, standby)
        event_type: String,

        /// Seconds every daemon gets to acknowledge (0 = supervisor default)
        #[arg(short, long, default_value = "0")]
        timeout: u32,
    },

    /// Show the node's cluster state
    Activation,

    /// Show supervisor state flags
    Flags,

    /// Leave the cluster ERROR state after a failed transition
    ClearError,

    /// Report that a daemon is ready (run by the daemon itself)
    Ready {
        /// PID of the daemon
        #[arg(long)]
        pid: u32,

        /// Local socket the daemon receives cluster events on
        #[arg(long)]
        channel: Option<String>,
    },

    /// Answer the cluster event in flight (run by the daemon itself)
    Ack {
        /// PID of the daemon
        #[arg(long)]
        pid: u32,

        /// Report that the event could not be applied
        #[arg(long)]
        failed: bool,
    },

    /// Check that the supervisor is alive
    Ping,

    /// Ask the supervisor to stop every daemon and exit
    Shutdown,
}
