//! TBM Monitor - Runtime for monitoring and controlling testbed nodes
//!
//! This crate talks to the site manager gateway and keeps a live view of
//! every node in the roster:
//! - `channel` - down-channel reader and up-channel command sender
//! - `bus` - pattern-matched dispatch of down-channel lines to listeners
//! - `node` - per-node liveness, log collection, commands and expectations
//! - `fanout` - node collections, selection and parallel operations
//! - `actions` - programming and resetting TelosB nodes over ssh
//! - `session` - composition root tying the above together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Session                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐  lines   ┌──────────────┐  LineMatch       │
//! │  │ LineChannel  │─────────▶│   EventBus   │───────────┐      │
//! │  │ (down: read) │          │ (listeners)  │           │      │
//! │  └──────▲───────┘          └──────────────┘           ▼      │
//! │         │ up: one command per connection      ┌────────────┐ │
//! │         └─────────────────────────────────────│   Node     │ │
//! │                                               │ (per gid)  │ │
//! │                                               └────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - Timeouts are reported as values, not errors
//! - A lost channel fails pending waits instead of hanging them

pub mod actions;
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod fanout;
pub mod node;
pub mod session;

pub use actions::{close_serial, open_serial, NodeActions, Program, Reset, TelosbActions};
pub use bus::{EventBus, Handler, ListenerId, Subscription};
pub use channel::{ChannelState, LineChannel, LineHook, MAX_LINE_LENGTH};
pub use config::{ConfigError, GatewayConfig, MonitorConfig, NodeSettings};
pub use error::{MonitorError, Result};
pub use fanout::{
    from_fn, FanOut, Matcher, NodeCollection, NodeCommand, NodeOperation, OperationFuture,
    Outcome, Selector,
};
pub use node::{
    Expectation, HostResolver, IdentityResolver, Liveness, Node, NodeAddress, NodeContext,
    NodeRegistry, NodeStatus, StaticHosts, DEFAULT_SEQUENCE_TIMEOUT, DEFAULT_SEQUENCE_TRIES,
};
pub use session::Session;
