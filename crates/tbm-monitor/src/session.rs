//! Monitor session: the composition root.
//!
//! A `Session` owns the channel to the site manager, the event bus fed by
//! it and one node per roster entry. Nodes start listening on the bus as
//! soon as the session is built; nothing arrives until `connect`.
//!
//! # Example
//!
//! ```rust,ignore
//! use tbm_monitor::{MonitorConfig, NodeCommand, Selector, Session};
//!
//! let session = Session::open(MonitorConfig::load_default()?, "nodes.txt").await?;
//! let telosb = session.nodes().select(&Selector::new().exact("type", "telosb"));
//! let online = telosb.run_parallel(NodeCommand::IsOnline).await;
//! session.shutdown().await;
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{info, warn};

use tbm_core::{load_roster, NodeDescriptor};
use tbm_protocol::{any_log_pattern, LineMatch};

use crate::bus::{EventBus, ListenerId};
use crate::channel::{LineChannel, LineHook};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::fanout::NodeCollection;
use crate::node::{
    HostResolver, IdentityResolver, Node, NodeContext, NodeRegistry, NodeStatus, StaticHosts,
};

/// Timestamp format of `log_to_file` lines.
const LOG_FILE_DATE_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Placeholder for an unknown gid or rime address in `log_to_file` lines.
const UNKNOWN: &str = "??";

/// A monitoring session over one site manager.
pub struct Session {
    config: MonitorConfig,
    channel: Arc<LineChannel>,
    bus: EventBus,
    registry: NodeRegistry,
    listeners: Mutex<Vec<ListenerId>>,
}

impl Session {
    /// Builds a session with one unseen node per descriptor.
    ///
    /// Does not connect.
    pub fn new(config: MonitorConfig, roster: Vec<NodeDescriptor>) -> Result<Self> {
        let channel = Arc::new(LineChannel::new(config.gateway.clone()));
        let bus = EventBus::new();
        let resolver: Arc<dyn HostResolver> = if config.hosts.is_empty() {
            Arc::new(IdentityResolver)
        } else {
            Arc::new(StaticHosts::new(config.hosts.clone()))
        };
        let ctx = NodeContext::new(bus.clone(), Arc::clone(&channel), config.nodes, resolver);
        let registry = NodeRegistry::build(roster, &ctx)?;

        Ok(Self {
            config,
            channel,
            bus,
            registry,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Loads the roster file and builds a session from it.
    pub fn from_roster_file(config: MonitorConfig, roster: impl AsRef<Path>) -> Result<Self> {
        let descriptors = load_roster(roster)?;
        Self::new(config, descriptors)
    }

    /// Loads the roster, builds the session and connects it.
    pub async fn open(config: MonitorConfig, roster: impl AsRef<Path>) -> Result<Self> {
        let session = Self::from_roster_file(config, roster)?;
        session.connect().await?;
        Ok(session)
    }

    /// Connects to the site manager and starts feeding the bus.
    pub async fn connect(&self) -> Result<()> {
        let bus = self.bus.clone();
        let hook: LineHook = Arc::new(move |line: &str| {
            bus.dispatch(line);
        });
        self.channel.connect(hook).await?;
        info!(
            gateway = %self.config.gateway.host,
            nodes = self.registry.len(),
            "Session connected"
        );
        Ok(())
    }

    /// Stops the reader, closes the channel and releases every listener
    /// the session installed.
    pub async fn shutdown(&self) {
        self.channel.disconnect().await;
        for id in self.listeners.lock().drain(..) {
            self.bus.unsubscribe(id);
        }
        for node in self.registry.iter() {
            node.detach();
        }
        info!("Session shut down");
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn channel(&self) -> &Arc<LineChannel> {
        &self.channel
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// All nodes of the roster.
    pub fn nodes(&self) -> NodeCollection {
        self.registry.collection()
    }

    pub fn node(&self, gid: &str) -> Option<&Node> {
        self.registry.get(gid)
    }

    pub fn status(&self) -> Vec<NodeStatus> {
        self.registry.iter().map(Node::status).collect()
    }

    /// Registers a handler for every line matching `pattern`.
    ///
    /// The listener lives until `unsubscribe` or session shutdown.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(&LineMatch) + Send + Sync + 'static,
    {
        let regex = Regex::new(pattern).map_err(|e| MonitorError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.track(self.bus.subscribe(regex, handler)))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.lock().retain(|tracked| *tracked != id);
        self.bus.unsubscribe(id)
    }

    /// Appends every log event of every node to `path`.
    ///
    /// Lines read `<local time> <gid> <rime> <text>`, with `??` for a gid
    /// or rime address that is not known. Truncates the file unless
    /// `append` is set.
    ///
    /// Each line is written and flushed on the reader task before the next
    /// record is dispatched, so a slow disk delays every other listener.
    pub fn log_to_file(&self, path: impl AsRef<Path>, append: bool) -> Result<ListenerId> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        let file = Mutex::new(file);

        let registry = self.registry.clone();
        let handler = move |m: &LineMatch| {
            let (gid, rime) = m
                .field("port")
                .and_then(|port| port.parse::<u16>().ok())
                .zip(m.field("ip"))
                .and_then(|(port, ip)| registry.find_by_address(ip, port))
                .map(|node| {
                    let rime = node
                        .kind()
                        .is_telosb()
                        .then(|| node.descriptor().rime_addr.clone());
                    (node.gid().to_string(), rime)
                })
                .unwrap_or_else(|| (UNKNOWN.to_string(), None));

            let line = format!(
                "{} {gid} {} {}",
                Local::now().format(LOG_FILE_DATE_FMT),
                rime.as_deref().unwrap_or(UNKNOWN),
                m.field("logline").unwrap_or_default()
            );

            let mut file = file.lock();
            if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                warn!(error = %e, "Failed to write log file");
            }
        };

        let id = self.bus.subscribe(any_log_pattern()?, handler);
        info!(path = %path.display(), append, "Logging node output to file");
        Ok(self.track(id))
    }

    fn track(&self, id: ListenerId) -> ListenerId {
        self.listeners.lock().push(id);
        id
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel)
            .field("nodes", &self.registry.len())
            .field("bus", &self.bus)
            .finish()
    }
}
