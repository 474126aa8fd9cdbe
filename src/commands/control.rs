use anyhow::{Context, Result};
use nodemgr::supervisor::protocol::{StatusEntry, VerboseEntry, VerboseStatus};
use nodemgr::supervisor::{DaemonClient, TransitionOutcome};
use nodemgr::Settings;
use serde_json::{json, Value};
use std::path::Path;

fn client(config_dir: &Path) -> Result<DaemonClient> {
    let settings = Settings::load(config_dir)?;
    Ok(DaemonClient::with_socket(settings.socket_path))
}

fn ensure_running(client: &DaemonClient) -> Result<()> {
    if !client.is_running() {
        anyhow::bail!(
            "Supervisor is not running (no answer on {})",
            client.socket_path().display()
        );
    }
    Ok(())
}

pub(crate) fn cmd_status(config_dir: &Path, names: &[String], verbose: bool, json: bool) -> Result<()> {
    let client = client(config_dir)?;
    ensure_running(&client)?;

    if verbose {
        let entries = client.verbose_status(names).context("Status query failed")?;
        if json {
            let values: Vec<Value> = entries.iter().map(verbose_json).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        } else {
            entries.iter().for_each(print_verbose);
        }
        return Ok(());
    }

    let entries = client.status(names).context("Status query failed")?;
    if json {
        let values: Vec<Value> = entries.iter().map(status_json).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    println!("{:<20} {:<12} {:>8}  CHANNEL", "DAEMON", "TYPE", "PID");
    for entry in &entries {
        match entry {
            StatusEntry::Found(status) => println!(
                "{:<20} {:<12} {:>8}  {}",
                status.name,
                status.process_type,
                pid_label(status.pid),
                status.channel.as_deref().unwrap_or("-")
            ),
            StatusEntry::Missing { name, message } => println!("{:<20} error: {}", name, message),
        }
    }
    Ok(())
}

fn pid_label(pid: u32) -> String {
    if pid == 0 {
        "stopped".to_string()
    } else {
        pid.to_string()
    }
}

fn status_json(entry: &StatusEntry) -> Value {
    match entry {
        StatusEntry::Found(status) => json!({
            "name": status.name,
            "type": status.process_type,
            "pid": status.pid,
            "channel": status.channel,
        }),
        StatusEntry::Missing { name, message } => json!({ "name": name, "error": message }),
    }
}

fn verbose_json(entry: &VerboseEntry) -> Value {
    match entry {
        VerboseEntry::Found(status) => json!({
            "name": status.status.name,
            "type": status.status.process_type,
            "pid": status.status.pid,
            "channel": status.status.channel,
            "config_path": status.config_path,
            "description": status.description,
            "start_time": status.start_time,
            "argv": status.argv,
            "last_exit": status.last_exit,
            "stderr_tail": status.stderr_tail,
        }),
        VerboseEntry::Missing { name, message } => json!({ "name": name, "error": message }),
    }
}

fn print_verbose(entry: &VerboseEntry) {
    let status: &VerboseStatus = match entry {
        VerboseEntry::Found(status) => status,
        VerboseEntry::Missing { name, message } => {
            println!("{}: {}\n", name, message);
            return;
        }
    };

    println!("{}", status.status.name);
    println!("  Type:        {}", status.status.process_type);
    println!("  PID:         {}", pid_label(status.status.pid));
    println!("  Channel:     {}", status.status.channel.as_deref().unwrap_or("-"));
    println!("  Config:      {}", status.config_path);
    if let Some(ref description) = status.description {
        println!("  Description: {}", description);
    }
    match status.start_time {
        Some(secs) => println!("  Started:     {} (unix)", secs),
        None => println!("  Started:     unavailable"),
    }
    if let Some(code) = status.last_exit {
        println!("  Last exit:   {}", code);
    }
    println!("  Command:     {}", status.argv.join(" "));
    match status.stderr_tail {
        Some(ref lines) if !lines.is_empty() => {
            println!("  Stderr:");
            for line in lines {
                println!("    {}", line);
            }
        }
        Some(_) => println!("  Stderr:      empty"),
        None => println!("  Stderr:      unavailable"),
    }
    println!();
}

pub(crate) fn cmd_transition(config_dir: &Path, event_type: &str, timeout: u32) -> Result<()> {
    let client = client(config_dir)?;
    ensure_running(&client)?;

    let (outcome, message) = client.transition(event_type, timeout)?;
    match message {
        Some(message) => println!("{}: {}", outcome.as_str(), message),
        None => println!("{}", outcome.as_str()),
    }
    if outcome != TransitionOutcome::Ok {
        anyhow::bail!("Transition to '{}' was not applied", event_type);
    }
    Ok(())
}

pub(crate) fn cmd_activation(config_dir: &Path) -> Result<()> {
    let client = client(config_dir)?;
    ensure_running(&client)?;

    let activation = client.node_activation()?;
    println!("State:         {}({})", activation.stability, activation.event_type);
    println!("System active: {}", activation.system_active);
    Ok(())
}

pub(crate) fn cmd_flags(config_dir: &Path) -> Result<()> {
    let client = client(config_dir)?;
    let flags = client.state_flags()?;
    println!("0x{:02x} {}", flags.0, flags.names().join(" "));
    Ok(())
}

pub(crate) fn cmd_clear_error(config_dir: &Path) -> Result<()> {
    let client = client(config_dir)?;
    client.clear_cluster_error()?;
    println!("Cluster error cleared");
    Ok(())
}

pub(crate) fn cmd_ready(config_dir: &Path, pid: u32, channel: Option<String>) -> Result<()> {
    let client = client(config_dir)?;
    client
        .ready(pid, channel)
        .with_context(|| format!("Ready notification for PID {} rejected", pid))
}

pub(crate) fn cmd_ack(config_dir: &Path, pid: u32, success: bool) -> Result<()> {
    let client = client(config_dir)?;
    client
        .acknowledge(pid, success)
        .with_context(|| format!("Acknowledgement for PID {} rejected", pid))
}

pub(crate) fn cmd_ping(config_dir: &Path) -> Result<()> {
    let client = client(config_dir)?;
    let info = client.ping()?;
    println!(
        "nodemgr v{} {} (uptime: {})",
        info.version,
        info.phase,
        format_duration(info.uptime_secs)
    );
    Ok(())
}

pub(crate) fn cmd_shutdown(config_dir: &Path) -> Result<()> {
    let client = client(config_dir)?;
    if !client.is_running() {
        println!("Supervisor is not running");
        return Ok(());
    }

    client.shutdown()?;

    for _ in 0..100 {
        if !client.socket_path().exists() {
            println!("Supervisor stopped");
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    println!("Supervisor may still be stopping (check with `nodemgr ping`)");
    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
