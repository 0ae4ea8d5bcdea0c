//! Error types for the monitor runtime.
//!
//! Timeouts are not errors: waits that run out report `Ok(None)` or
//! `Ok(false)`. Everything else that can go wrong surfaces as a
//! `MonitorError`, and fan-out operations record one per failing node.

use std::io;

use thiserror::Error;

use tbm_core::{Gid, RosterError};
use tbm_protocol::ProtocolError;

use crate::config::ConfigError;

/// Errors produced by the monitor runtime.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The node roster could not be loaded.
    #[error(transparent)]
    Roster(#[from] RosterError),

    /// The configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A command payload violated the up-channel framing.
    ///
    /// Rejected locally; nothing is sent and the down-channel is untouched.
    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    /// A caller-supplied pattern did not compile.
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Could not open a connection to the site manager.
    #[error("Failed to connect to site manager at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Connecting to the site manager took too long.
    #[error("Timed out connecting to site manager at {addr}")]
    ConnectTimeout { addr: String },

    /// The down-channel is already connected.
    #[error("Channel already connected")]
    AlreadyConnected,

    /// The down-channel closed or failed while waiting for an event.
    #[error("Channel closed")]
    ChannelClosed,

    /// The node has not pinged yet, so its address is unknown.
    #[error("Node {gid} has not been seen yet")]
    NodeUnseen { gid: Gid },

    /// No node with this gid is in the roster.
    #[error("Unknown node: {gid}")]
    UnknownNode { gid: Gid },

    /// A node action (program, reset) could not run.
    #[error("Action {action} failed on {node}: {reason}")]
    Action {
        action: String,
        node: String,
        reason: String,
    },

    /// A fan-out task ended without producing a result.
    #[error("Task for {node} failed: {reason}")]
    TaskFailed { node: String, reason: String },

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for MonitorError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidCommand { reason } => Self::InvalidCommand { reason },
            ProtocolError::InvalidPattern { pattern, source } => Self::InvalidPattern {
                pattern,
                reason: source.to_string(),
            },
        }
    }
}

/// Convenience Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
