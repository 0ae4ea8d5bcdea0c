//! TBM Protocol - Site manager wire formats
//!
//! The site manager multiplexes every node's traffic onto one down-channel
//! of newline-terminated text records and accepts one command per
//! connection on a separate up-channel.
//!
//! - `down` - ping and log frames, and the patterns that match them
//! - `up` - framing of outbound commands
//! - `control` - the control commands understood by the node clients

pub mod control;
pub mod down;
pub mod error;
pub mod up;

pub use control::ControlCommand;
pub use down::{
    any_log_pattern, expect_pattern, log_pattern, ping_pattern, LineMatch, LogLine, PingFrame,
    LOG_EVENT_TYPE,
};
pub use error::ProtocolError;
pub use up::{encode_command, validate_payload, LINE_TERMINATOR};
