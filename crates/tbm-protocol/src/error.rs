//! Protocol errors.

use thiserror::Error;

/// Errors produced while building or interpreting wire records.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A command payload must carry exactly one trailing terminator.
    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    /// A caller-supplied pattern is not a valid regular expression.
    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
