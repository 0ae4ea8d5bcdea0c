//! Domain-specific error types following panic-free policy.

use std::path::PathBuf;

use thiserror::Error;

use crate::Gid;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors raised while loading a node roster.
///
/// Every variant is fatal: a roster that fails to load aborts session
/// construction instead of skipping the offending node.
#[derive(Error, Debug)]
pub enum RosterError {
    /// The roster file could not be read.
    #[error("Failed to read roster {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A non-comment line did not contain `gid type tos_id rime_addr`.
    #[error("Failed to parse roster line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// The same gid appears on two lines.
    #[error("Duplicate gid {gid} on roster line {line} (first defined on line {first})")]
    DuplicateGid { gid: Gid, line: usize, first: usize },
}
