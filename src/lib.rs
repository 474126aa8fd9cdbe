pub mod clienv;
pub mod config;
pub mod error;
pub mod supervisor;

pub use config::Settings;
pub use error::{Result, SupervisorError};
pub use supervisor::{DaemonClient, Registry, Supervisor};
