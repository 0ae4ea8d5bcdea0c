//! Per-node state tracking and control.
//!
//! A `Node` is created unseen for every roster entry and learns everything
//! else from the down-channel:
//!
//! - the first ping carrying its gid fixes its address for good and
//!   installs a listener collecting its log events
//! - every ping refreshes its last-seen instant and application id
//!
//! Liveness is derived from the last-seen instant on the tokio clock, so
//! tests can drive it with a paused runtime.
//!
//! **Panic-Free Policy:** no `.unwrap()` or `.expect()` outside tests.

mod expect;
mod registry;

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use tbm_core::{Gid, LogRecord, LogRing, NodeDescriptor, NodeKind};
use tbm_protocol::{
    log_pattern, ping_pattern, ControlCommand, LineMatch, LogLine, PingFrame, LOG_EVENT_TYPE,
};

use crate::bus::{EventBus, ListenerId};
use crate::channel::LineChannel;
use crate::config::NodeSettings;
use crate::error::{MonitorError, Result};

pub use expect::{Expectation, DEFAULT_SEQUENCE_TIMEOUT, DEFAULT_SEQUENCE_TRIES};
pub use registry::NodeRegistry;

// ============================================================================
// Host Resolution
// ============================================================================

/// Maps a node client IP to the host name used for display and actions.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> String;
}

/// Uses the IP itself as host name.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl HostResolver for IdentityResolver {
    fn resolve(&self, ip: &str) -> String {
        ip.to_string()
    }
}

/// Static IP to host name table; unknown IPs resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticHosts {
    table: HashMap<String, String>,
}

impl StaticHosts {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

impl HostResolver for StaticHosts {
    fn resolve(&self, ip: &str) -> String {
        self.table.get(ip).cloned().unwrap_or_else(|| ip.to_string())
    }
}

// ============================================================================
// Node Context
// ============================================================================

/// Session services a node uses: the bus it listens on and the channel it
/// sends through.
#[derive(Clone)]
pub struct NodeContext {
    bus: EventBus,
    channel: Arc<LineChannel>,
    settings: NodeSettings,
    resolver: Arc<dyn HostResolver>,
}

impl NodeContext {
    pub fn new(
        bus: EventBus,
        channel: Arc<LineChannel>,
        settings: NodeSettings,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            bus,
            channel,
            settings,
            resolver,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn channel(&self) -> &Arc<LineChannel> {
        &self.channel
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("bus", &self.bus)
            .field("settings", &self.settings)
            .finish()
    }
}

// ============================================================================
// Node State
// ============================================================================

/// Where a node client lives, fixed by its first ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAddress {
    pub ip: String,
    pub port: u16,
    pub host: String,
}

/// Liveness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// No ping received yet
    Unseen,
    /// Pinged within the online timeout
    Online,
    /// Seen before, but silent for longer than the timeout
    Offline,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unseen => write!(f, "unseen"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Default)]
struct NodeState {
    address: Option<NodeAddress>,
    last_seen: Option<Instant>,
    app_id: Option<String>,
    attributes: Vec<(String, String)>,
    ping_listener: Option<ListenerId>,
    log_listener: Option<ListenerId>,
}

/// Point-in-time view of a node, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub gid: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub display: String,
    pub liveness: Liveness,
    pub address: Option<NodeAddress>,
    pub app_id: Option<String>,
    /// Milliseconds since the last ping
    pub last_seen_ms: Option<u64>,
    pub attributes: Vec<(String, String)>,
    pub log_records: usize,
}

// ============================================================================
// Node
// ============================================================================

struct NodeInner {
    descriptor: NodeDescriptor,
    state: RwLock<NodeState>,
    log: Mutex<LogRing>,
    ctx: NodeContext,
}

/// Handle to one testbed node. Cheap to clone; clones are the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Creates an unseen node and starts listening for its pings.
    pub fn new(descriptor: NodeDescriptor, ctx: NodeContext) -> Result<Self> {
        let ping = ping_pattern(&descriptor.gid)?;
        let inner = Arc::new(NodeInner {
            log: Mutex::new(LogRing::new(ctx.settings.log_capacity)),
            state: RwLock::new(NodeState::default()),
            descriptor,
            ctx,
        });

        let weak: Weak<NodeInner> = Arc::downgrade(&inner);
        let id = inner.ctx.bus.subscribe(ping, move |m| {
            if let Some(inner) = weak.upgrade() {
                inner.on_ping(m);
            }
        });
        inner.state.write().ping_listener = Some(id);

        debug!(gid = %inner.descriptor.gid, "Node created");
        Ok(Self { inner })
    }

    pub fn gid(&self) -> &Gid {
        &self.inner.descriptor.gid
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.inner.descriptor
    }

    pub fn kind(&self) -> &NodeKind {
        &self.inner.descriptor.kind
    }

    pub fn address(&self) -> Option<NodeAddress> {
        self.inner.state.read().address.clone()
    }

    pub fn host(&self) -> Option<String> {
        self.inner.state.read().address.as_ref().map(|a| a.host.clone())
    }

    pub fn app_id(&self) -> Option<String> {
        self.inner.state.read().app_id.clone()
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.inner.state.read().last_seen
    }

    /// Attributes of the most recent ping.
    pub fn ping_attributes(&self) -> Vec<(String, String)> {
        self.inner.state.read().attributes.clone()
    }

    pub fn is_seen(&self) -> bool {
        self.inner.state.read().address.is_some()
    }

    /// Returns true if the node pinged within the online timeout.
    pub fn is_online(&self) -> bool {
        self.liveness() == Liveness::Online
    }

    pub fn liveness(&self) -> Liveness {
        match self.last_seen() {
            None => Liveness::Unseen,
            Some(at) if at.elapsed() < self.inner.ctx.settings.online_timeout() => {
                Liveness::Online
            }
            Some(_) => Liveness::Offline,
        }
    }

    /// Returns true while the last ping carried an application id.
    pub fn is_app_running(&self) -> bool {
        self.inner.state.read().app_id.is_some()
    }

    /// Waits until the node is online, checking at the poll interval.
    ///
    /// Never gives up; bound it with `tokio::time::timeout` if needed.
    pub async fn block_until_online(&self) {
        let interval = self.inner.ctx.settings.poll_interval();
        while !self.is_online() {
            sleep(interval).await;
        }
    }

    /// Waits until the running-app flag equals `running`.
    pub async fn block_until_app(&self, running: bool) {
        let interval = self.inner.ctx.settings.poll_interval();
        while self.is_app_running() != running {
            sleep(interval).await;
        }
    }

    /// Looks up a selection attribute.
    ///
    /// Roster attributes are always present; `ip`, `port` and `host` only
    /// once the node has been seen.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "ip" | "port" | "host" => {
                let state = self.inner.state.read();
                let addr = state.address.as_ref()?;
                Some(match name {
                    "ip" => addr.ip.clone(),
                    "port" => addr.port.to_string(),
                    _ => addr.host.clone(),
                })
            }
            _ => self.inner.descriptor.attribute(name),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Sends raw command text to this node's client.
    ///
    /// The terminator is appended here; `text` must not contain one.
    pub async fn send_command(&self, text: &str, period: u32) -> Result<()> {
        let addr = self.address().ok_or_else(|| MonitorError::NodeUnseen {
            gid: self.gid().clone(),
        })?;
        let payload = format!("{text}\n");
        self.inner
            .ctx
            .channel
            .send(&addr.ip, addr.port, &payload, period)
            .await
    }

    async fn send_control(&self, command: ControlCommand, period: u32) -> Result<()> {
        self.send_command(&command.to_text(), period).await
    }

    pub async fn set_position(&self, position: &str) -> Result<()> {
        self.send_control(ControlCommand::PositionUpdate(position.to_string()), 0)
            .await
    }

    /// Starts the application with the given arguments.
    pub async fn start_app<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into).collect();
        self.send_control(ControlCommand::NetUp(args), 0).await
    }

    pub async fn stop_app(&self) -> Result<()> {
        self.send_control(ControlCommand::NetDown, 0).await
    }

    /// Writes `message` to the standard input of the application.
    pub async fn send_to_app(&self, message: &str, period: u32) -> Result<()> {
        self.send_control(ControlCommand::SendToApp(message.to_string()), period)
            .await
    }

    // ------------------------------------------------------------------------
    // Log
    // ------------------------------------------------------------------------

    /// Returns up to `n` of the most recent log events, oldest first.
    ///
    /// Raw mode returns the lines as received. Otherwise each line is
    /// rendered with its timestamp and the node name, and an empty result is
    /// replaced by a single placeholder line.
    pub fn tail(&self, n: usize, raw: bool) -> Vec<String> {
        let records = self.inner.log.lock().tail(n);
        if raw {
            return records.into_iter().map(|r| r.raw).collect();
        }

        let who = self.to_string();
        let mut lines: Vec<String> = records.iter().map(|r| r.render(&who)).collect();
        if lines.is_empty() {
            lines.push(LogRecord::placeholder(&who));
        }
        lines
    }

    /// Removes this node's listeners from the bus.
    ///
    /// The node keeps its state but stops tracking the down-channel.
    pub fn detach(&self) {
        let mut state = self.inner.state.write();
        for id in [state.ping_listener.take(), state.log_listener.take()]
            .into_iter()
            .flatten()
        {
            self.inner.ctx.bus.unsubscribe(id);
        }
    }

    pub fn log_len(&self) -> usize {
        self.inner.log.lock().len()
    }

    pub fn status(&self) -> NodeStatus {
        let liveness = self.liveness();
        let state = self.inner.state.read();
        NodeStatus {
            gid: self.gid().to_string(),
            type_name: self.inner.descriptor.type_name.clone(),
            display: display_name(self.gid(), state.address.as_ref()),
            liveness,
            address: state.address.clone(),
            app_id: state.app_id.clone(),
            last_seen_ms: state
                .last_seen
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
            attributes: state.attributes.clone(),
            log_records: self.log_len(),
        }
    }
}

impl NodeInner {
    fn on_ping(self: &Arc<Self>, m: &LineMatch) {
        // Log text that happens to start with our gid and a `{...}` block
        if m.field("type") == Some(LOG_EVENT_TYPE) {
            return;
        }
        let Some(frame) = PingFrame::from_match(m) else {
            warn!(gid = %self.descriptor.gid, line = %m.line, "Malformed ping frame");
            return;
        };

        let mut state = self.state.write();

        match &state.address {
            None => {
                let host = self.ctx.resolver.resolve(&frame.ip);
                state.log_listener = self.listen_for_logs(&frame.ip, frame.port);
                info!(
                    gid = %self.descriptor.gid,
                    ip = %frame.ip,
                    port = frame.port,
                    host = %host,
                    "Node seen"
                );
                state.address = Some(NodeAddress {
                    ip: frame.ip.clone(),
                    port: frame.port,
                    host,
                });
            }
            Some(addr) if addr.ip != frame.ip || addr.port != frame.port => {
                debug!(
                    gid = %self.descriptor.gid,
                    ip = %frame.ip,
                    port = frame.port,
                    "Ping from a different address ignored for addressing"
                );
            }
            Some(_) => {}
        }

        if state.app_id != frame.app_id {
            debug!(gid = %self.descriptor.gid, app_id = ?frame.app_id, "Application state changed");
        }
        state.app_id = frame.app_id;
        state.attributes = frame.attributes;
        state.last_seen = Some(Instant::now());
    }

    fn listen_for_logs(self: &Arc<Self>, ip: &str, port: u16) -> Option<ListenerId> {
        let pattern = match log_pattern(ip, port) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(gid = %self.descriptor.gid, error = %e, "Cannot listen for log events");
                return None;
            }
        };

        let weak = Arc::downgrade(self);
        Some(self.ctx.bus.subscribe(pattern, move |m| {
            if let Some(inner) = weak.upgrade() {
                inner.on_log(m);
            }
        }))
    }

    fn on_log(&self, m: &LineMatch) {
        match LogLine::from_match(m) {
            Some(log) => self.log.lock().push(log.record),
            None => warn!(gid = %self.descriptor.gid, line = %m.line, "Malformed log event"),
        }
    }
}

fn display_name(gid: &Gid, address: Option<&NodeAddress>) -> String {
    match address {
        Some(addr) => format!("{gid}@{}", addr.host),
        None => format!("{gid}@?"),
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.pad(&display_name(self.gid(), state.address.as_ref()))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("gid", self.gid())
            .field("address", &self.address())
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}
