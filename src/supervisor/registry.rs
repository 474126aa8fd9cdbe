//! Daemon registry: configuration entries → [`Daemon`] records and ordering views.
//!
//! A registry is built in one shot. Any malformed entry, name collision or
//! order collision fails the whole load and nothing is registered.
//!
//! ```text
//! daemons.d/*.toml ──► DaemonEntry ──► Daemon ──┬─► by name
//!                                               ├─► start view   (order → node)
//!                                               ├─► stop view    (order → node)
//!                                               └─► event views  (one per event type,
//!                                                                 supervisor entry last)
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::cluster::EventType;
use super::launcher::Signal;
use super::process::{Process, ProcessRole};
use crate::error::{Result, SupervisorError};

/// Order of the supervisor's own entry in every event view.
pub const SUPERVISOR_EVENT_ORDER: i64 = i64::MAX;

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

/// One `[[daemon]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DaemonEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub process_type: String,
    #[serde(default)]
    pub platform: bool,
    #[serde(default)]
    pub start_wait: bool,
    /// Start/stop timeout; the supervisor default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub stop_command: Option<Vec<String>>,
    #[serde(default)]
    pub stderr_rotate: Option<u32>,
    #[serde(default)]
    pub start_order: Option<i64>,
    #[serde(default)]
    pub stop_order: Option<i64>,
    /// Event type name → delivery order
    #[serde(default)]
    pub events: BTreeMap<String, i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DaemonEntry {
    pub fn new(name: impl Into<String>, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            process_type: "daemon".to_string(),
            platform: false,
            start_wait: false,
            timeout_ms: None,
            stop_signal: default_stop_signal(),
            command: command.into_iter().map(Into::into).collect(),
            stop_command: None,
            stderr_rotate: None,
            start_order: None,
            stop_order: None,
            events: BTreeMap::new(),
            description: None,
        }
    }

    pub fn start_order(mut self, order: i64) -> Self {
        self.start_order = Some(order);
        self
    }

    pub fn stop_order(mut self, order: i64) -> Self {
        self.stop_order = Some(order);
        self
    }

    pub fn event(mut self, event: EventType, order: i64) -> Self {
        self.events.insert(event.as_str().to_string(), order);
        self
    }

    pub fn start_wait(mut self, wait: bool) -> Self {
        self.start_wait = wait;
        self
    }

    pub fn platform(mut self, platform: bool) -> Self {
        self.platform = platform;
        self
    }

    pub fn stop_command(mut self, argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stop_command = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonFile {
    #[serde(default)]
    daemon: Vec<DaemonEntry>,
}

/// One configured long-running service.
#[derive(Debug)]
pub struct Daemon {
    name: String,
    process_type: String,
    platform: bool,
    start_wait: bool,
    timeout: Option<Duration>,
    stop_signal: Signal,
    stderr_rotate: Option<u32>,
    description: Option<String>,
    config_path: PathBuf,
    start_order: Option<i64>,
    stop_order: Option<i64>,
    event_orders: BTreeMap<EventType, i64>,
    primary: Process,
    stop: Option<Process>,
}

impl Daemon {
    fn from_entry(entry: DaemonEntry, config_path: PathBuf) -> Result<Self> {
        let invalid = |reason: String| SupervisorError::Config {
            path: config_path.clone(),
            reason,
        };

        if entry.name.trim().is_empty() {
            return Err(invalid("daemon with an empty name".to_string()));
        }
        if entry.command.is_empty() || entry.command[0].trim().is_empty() {
            return Err(invalid(format!("daemon '{}' has an empty command", entry.name)));
        }
        if let Some(ref stop) = entry.stop_command {
            if stop.is_empty() || stop[0].trim().is_empty() {
                return Err(invalid(format!(
                    "daemon '{}' has an empty stop command",
                    entry.name
                )));
            }
        }

        let stop_signal = entry
            .stop_signal
            .parse::<Signal>()
            .map_err(|_| SupervisorError::InvalidSignal {
                daemon: entry.name.clone(),
                signal: entry.stop_signal.clone(),
            })?;

        let mut event_orders = BTreeMap::new();
        for (event, order) in &entry.events {
            let event = event.parse::<EventType>()?;
            event_orders.insert(event, *order);
        }

        let stop = entry
            .stop_command
            .map(|argv| Process::new(ProcessRole::Stop, argv));

        Ok(Self {
            primary: Process::new(ProcessRole::Primary, entry.command),
            stop,
            name: entry.name,
            process_type: entry.process_type,
            platform: entry.platform,
            start_wait: entry.start_wait,
            timeout: entry.timeout_ms.map(Duration::from_millis),
            stop_signal,
            stderr_rotate: entry.stderr_rotate,
            description: entry.description,
            config_path,
            start_order: entry.start_order,
            stop_order: entry.stop_order,
            event_orders,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn is_platform(&self) -> bool {
        self.platform
    }

    /// Platform daemons are mandatory: their death outside shutdown is fatal.
    pub fn is_mandatory(&self) -> bool {
        self.platform
    }

    pub fn start_wait(&self) -> bool {
        self.start_wait
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn stop_signal(&self) -> Signal {
        self.stop_signal
    }

    pub fn stderr_rotate(&self) -> Option<u32> {
        self.stderr_rotate
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn start_order(&self) -> Option<i64> {
        self.start_order
    }

    pub fn stop_order(&self) -> Option<i64> {
        self.stop_order
    }

    pub fn event_order(&self, event: EventType) -> Option<i64> {
        self.event_orders.get(&event).copied()
    }

    pub fn primary(&self) -> &Process {
        &self.primary
    }

    pub fn stop_process(&self) -> Option<&Process> {
        self.stop.as_ref()
    }

    pub fn process(&self, role: ProcessRole) -> Option<&Process> {
        match role {
            ProcessRole::Primary => Some(&self.primary),
            ProcessRole::Stop => self.stop.as_ref(),
        }
    }
}

/// Which ordering a view expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Start,
    Stop,
    Event(EventType),
}

impl std::fmt::Display for ViewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewKind::Start => f.write_str("start"),
            ViewKind::Stop => f.write_str("stop"),
            ViewKind::Event(event) => write!(f, "event {}", event),
        }
    }
}

/// Receiver of an order node.
#[derive(Debug, Clone)]
pub enum NodeTarget {
    Daemon(Arc<Daemon>),
    /// The supervisor's own entry; applies node-local state on delivery
    Supervisor,
}

#[derive(Debug, Clone)]
pub struct OrderNode {
    pub order: i64,
    pub target: NodeTarget,
}

impl OrderNode {
    pub fn daemon(&self) -> Option<&Arc<Daemon>> {
        match self.target {
            NodeTarget::Daemon(ref daemon) => Some(daemon),
            NodeTarget::Supervisor => None,
        }
    }

    fn label(&self) -> &str {
        match self.target {
            NodeTarget::Daemon(ref daemon) => daemon.name(),
            NodeTarget::Supervisor => "nodemgr",
        }
    }
}

/// Ascending sequence of order nodes with unique order values.
#[derive(Debug)]
pub struct OrderView {
    kind: ViewKind,
    nodes: BTreeMap<i64, OrderNode>,
}

impl OrderView {
    fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            nodes: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    fn insert(&mut self, node: OrderNode) -> Result<()> {
        if let Some(existing) = self.nodes.get(&node.order) {
            return Err(SupervisorError::DuplicateOrder {
                view: self.kind.to_string(),
                order: node.order,
                daemon: node.label().to_string(),
                existing: existing.label().to_string(),
            });
        }
        self.nodes.insert(node.order, node);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderNode> {
        self.nodes.values()
    }

    /// Nodes with order ≤ `max`; all nodes when `max` is `None`.
    pub fn up_to(&self, max: Option<i64>) -> impl Iterator<Item = &OrderNode> {
        self.nodes
            .range(..=max.unwrap_or(i64::MAX))
            .map(|(_, node)| node)
    }

    pub fn orders(&self) -> Vec<i64> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug)]
pub struct Registry {
    daemons: BTreeMap<String, Arc<Daemon>>,
    start: OrderView,
    stop: OrderView,
    events: BTreeMap<EventType, OrderView>,
}

impl Registry {
    /// Loads every `*.toml` under `dir` in file-name order.
    pub fn load(dir: &Path) -> Result<Self> {
        info!("Loading daemon definitions from {}", dir.display());

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| SupervisorError::Config {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                files.push(path);
            }
        }
        files.sort();

        let mut entries = Vec::new();
        for path in files {
            let content = std::fs::read_to_string(&path)?;
            let file: DaemonFile = toml::from_str(&content).map_err(|e| SupervisorError::Config {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            debug!("{} defines {} daemon(s)", path.display(), file.daemon.len());
            entries.extend(file.daemon.into_iter().map(|entry| (path.clone(), entry)));
        }

        let registry = Self::from_entries(entries)?;
        info!("Registered {} daemon(s)", registry.len());
        Ok(registry)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (PathBuf, DaemonEntry)>) -> Result<Self> {
        let mut registry = Self {
            daemons: BTreeMap::new(),
            start: OrderView::new(ViewKind::Start),
            stop: OrderView::new(ViewKind::Stop),
            events: EventType::ALL
                .iter()
                .map(|event| (*event, OrderView::new(ViewKind::Event(*event))))
                .collect(),
        };

        for (path, entry) in entries {
            registry.register(Daemon::from_entry(entry, path)?)?;
        }

        for view in registry.events.values_mut() {
            view.insert(OrderNode {
                order: SUPERVISOR_EVENT_ORDER,
                target: NodeTarget::Supervisor,
            })?;
        }

        Ok(registry)
    }

    fn register(&mut self, daemon: Daemon) -> Result<()> {
        if self.daemons.contains_key(daemon.name()) {
            return Err(SupervisorError::DuplicateDaemon(daemon.name().to_string()));
        }

        let daemon = Arc::new(daemon);
        let mut placements = Vec::new();
        if let Some(order) = daemon.start_order() {
            placements.push((ViewKind::Start, order));
        }
        if let Some(order) = daemon.stop_order() {
            placements.push((ViewKind::Stop, order));
        }
        for (event, order) in &daemon.event_orders {
            placements.push((ViewKind::Event(*event), *order));
        }

        for (kind, order) in placements {
            if order == SUPERVISOR_EVENT_ORDER {
                return Err(SupervisorError::ReservedOrder {
                    view: kind.to_string(),
                    order,
                    daemon: daemon.name().to_string(),
                });
            }
            self.view_mut(kind).insert(OrderNode {
                order,
                target: NodeTarget::Daemon(Arc::clone(&daemon)),
            })?;
        }

        debug!(daemon = daemon.name(), "Registered daemon");
        self.daemons.insert(daemon.name().to_string(), daemon);
        Ok(())
    }

    fn view_mut(&mut self, kind: ViewKind) -> &mut OrderView {
        match kind {
            ViewKind::Start => &mut self.start,
            ViewKind::Stop => &mut self.stop,
            ViewKind::Event(event) => self
                .events
                .get_mut(&event)
                .expect("every event type has a view"),
        }
    }

    pub fn order_view(&self, kind: ViewKind) -> &OrderView {
        match kind {
            ViewKind::Start => &self.start,
            ViewKind::Stop => &self.stop,
            ViewKind::Event(event) => &self.events[&event],
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Daemon>> {
        self.daemons.get(name)
    }

    /// Daemons in name order.
    pub fn daemons(&self) -> impl Iterator<Item = &Arc<Daemon>> {
        self.daemons.values()
    }

    pub fn len(&self) -> usize {
        self.daemons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daemons.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(entry: DaemonEntry) -> (PathBuf, DaemonEntry) {
        (PathBuf::from("/etc/nodemgr/daemons.d/test.toml"), entry)
    }

    #[test]
    fn test_views_iterate_ascending() {
        let registry = Registry::from_entries([
            at(DaemonEntry::new("b", ["/bin/b"]).start_order(10).stop_order(1)),
            at(DaemonEntry::new("a", ["/bin/a"]).start_order(5).stop_order(3)),
            at(DaemonEntry::new("c", ["/bin/c"]).start_order(20)),
        ])
        .unwrap();

        let names: Vec<_> = registry
            .order_view(ViewKind::Start)
            .iter()
            .filter_map(|n| n.daemon().map(|d| d.name().to_string()))
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(registry.order_view(ViewKind::Stop).orders(), vec![1, 3]);
    }

    #[test]
    fn test_duplicate_order_fails_whole_load() {
        let err = Registry::from_entries([
            at(DaemonEntry::new("a", ["/bin/a"]).start_order(5)),
            at(DaemonEntry::new("b", ["/bin/b"]).start_order(5)),
        ])
        .unwrap_err();

        match err {
            SupervisorError::DuplicateOrder {
                order,
                daemon,
                existing,
                ..
            } => {
                assert_eq!(order, 5);
                assert_eq!(daemon, "b");
                assert_eq!(existing, "a");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let err = Registry::from_entries([
            at(DaemonEntry::new("a", ["/bin/a"])),
            at(DaemonEntry::new("a", ["/bin/other"])),
        ])
        .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateDaemon(name) if name == "a"));
    }

    #[test]
    fn test_duplicate_event_order_is_per_view() {
        // Same order in different views is fine.
        let registry = Registry::from_entries([
            at(DaemonEntry::new("a", ["/bin/a"]).start_order(1).event(EventType::Active, 1)),
            at(DaemonEntry::new("b", ["/bin/b"]).event(EventType::Standby, 1)),
        ])
        .unwrap();
        assert_eq!(registry.len(), 2);

        let err = Registry::from_entries([
            at(DaemonEntry::new("a", ["/bin/a"]).event(EventType::Active, 1)),
            at(DaemonEntry::new("b", ["/bin/b"]).event(EventType::Active, 1)),
        ])
        .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateOrder { .. }));
    }

    #[test]
    fn test_supervisor_entry_is_last_in_every_event_view() {
        let registry = Registry::from_entries([at(
            DaemonEntry::new("a", ["/bin/a"]).event(EventType::Active, 100),
        )])
        .unwrap();

        for event in EventType::ALL {
            let view = registry.order_view(ViewKind::Event(event));
            let last = view.iter().last().unwrap();
            assert_eq!(last.order, SUPERVISOR_EVENT_ORDER);
            assert!(matches!(last.target, NodeTarget::Supervisor));
        }
        assert_eq!(registry.order_view(ViewKind::Event(EventType::Active)).len(), 2);
    }

    #[test]
    fn test_reserved_order_is_rejected() {
        let err = Registry::from_entries([at(
            DaemonEntry::new("a", ["/bin/a"]).event(EventType::Active, SUPERVISOR_EVENT_ORDER),
        )])
        .unwrap_err();
        assert!(matches!(err, SupervisorError::ReservedOrder { .. }));
    }

    #[test]
    fn test_invalid_signal_and_event_are_rejected() {
        let mut entry = DaemonEntry::new("a", ["/bin/a"]);
        entry.stop_signal = "SIGNOPE".into();
        assert!(matches!(
            Registry::from_entries([at(entry)]).unwrap_err(),
            SupervisorError::InvalidSignal { .. }
        ));

        let mut entry = DaemonEntry::new("a", ["/bin/a"]);
        entry.events.insert("sideways".into(), 3);
        assert!(matches!(
            Registry::from_entries([at(entry)]).unwrap_err(),
            SupervisorError::UnknownEventType(_)
        ));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let entry = DaemonEntry::new("a", Vec::<String>::new());
        assert!(matches!(
            Registry::from_entries([at(entry)]).unwrap_err(),
            SupervisorError::Config { .. }
        ));
    }

    #[test]
    fn test_up_to_cutoff() {
        let registry = Registry::from_entries([
            at(DaemonEntry::new("a", ["/bin/a"]).stop_order(10)),
            at(DaemonEntry::new("b", ["/bin/b"]).stop_order(50)),
            at(DaemonEntry::new("c", ["/bin/c"]).stop_order(90)),
        ])
        .unwrap();
        let view = registry.order_view(ViewKind::Stop);
        assert_eq!(view.up_to(Some(50)).count(), 2);
        assert_eq!(view.up_to(None).count(), 3);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-core.toml"),
            r#"
[[daemon]]
name = "routed"
type = "control"
platform = true
start-wait = true
timeout-ms = 1500
stop-signal = "SIGINT"
command = ["/usr/sbin/routed", "--foreground"]
stop-command = ["/usr/sbin/routectl", "stop"]
stderr-rotate = 3
start-order = 10
stop-order = 90
description = "Routing daemon"

[daemon.events]
active = 10
standby = 20
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README"), "ignored").unwrap();

        let registry = Registry::load(dir.path()).unwrap();
        let routed = registry.get("routed").unwrap();
        assert_eq!(routed.process_type(), "control");
        assert!(routed.is_mandatory());
        assert!(routed.start_wait());
        assert_eq!(routed.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(routed.stop_signal(), Signal::Int);
        assert_eq!(routed.stderr_rotate(), Some(3));
        assert_eq!(routed.event_order(EventType::Standby), Some(20));
        assert_eq!(routed.primary().argv(), ["/usr/sbin/routed", "--foreground"]);
        assert!(routed.stop_process().is_some());
        assert!(routed.config_path().ends_with("10-core.toml"));
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.toml"),
            "[[daemon]]\nname = \"x\"\ntype = \"t\"\ncommand = [\"/x\"]\nrestart = true\n",
        )
        .unwrap();
        assert!(matches!(
            Registry::load(dir.path()).unwrap_err(),
            SupervisorError::Config { .. }
        ));
    }
}
