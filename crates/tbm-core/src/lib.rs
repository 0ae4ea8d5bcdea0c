//! TBM Core - Shared types for testbed monitoring
//!
//! This crate provides the domain types shared between the protocol
//! layer (tbm-protocol), the runtime (tbm-monitor) and the `tbm` CLI.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod log;
pub mod node;
pub mod roster;

// Re-exports for convenience
pub use error::{DomainError, DomainResult, RosterError};
pub use log::{LogRecord, LogRing, DEFAULT_LOG_CAPACITY};
pub use node::{Gid, NodeDescriptor, NodeKind};
pub use roster::{load_roster, parse_roster};
