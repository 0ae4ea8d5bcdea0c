//! Down-channel records.
//!
//! Every record starts with the site manager timestamp and the address of
//! the node client it belongs to:
//!
//! ```text
//! 1400000000123 10.0.0.7:5000 TELOSB n007 3f2a {pos=1.0;2.0,state=up}
//! 1400000000456 10.0.0.7:5000 LE_ALL Booting TinyOS...
//! ```
//!
//! Pings carry the node gid and, while an application session is open on
//! the node, an application id before the attribute block. Log events
//! (`LE_ALL`) carry free-form text.

use std::collections::HashMap;

use regex::Regex;
use tbm_core::{Gid, LogRecord};

use crate::ProtocolError;

/// Type token of log events; never the type of a ping.
pub const LOG_EVENT_TYPE: &str = "LE_ALL";

/// Common prefix: timestamp and node client address.
const ADDRESS_PREFIX: &str = r"^(?P<at>\d+) (?P<ip>[\d.]+):(?P<port>\d+) ";

// ============================================================================
// Patterns
// ============================================================================

/// Pattern matching ping frames of the node with the given gid.
///
/// Captures `at`, `ip`, `port`, `type`, the optional `id` and `attributes`.
/// Log event text shaped like a ping also matches; `PingFrame::from_match`
/// rejects it.
pub fn ping_pattern(gid: &Gid) -> Result<Regex, ProtocolError> {
    let source = format!(
        r"{ADDRESS_PREFIX}(?P<type>[^ ]+) {} (?:(?P<id>[^ {{][^ ]*) )?\{{(?P<attributes>[^}}]+)\}}",
        regex::escape(gid.as_str())
    );
    compile(source)
}

/// Pattern matching log events of the node client at `ip:port`.
///
/// Captures `at` and `logline`.
pub fn log_pattern(ip: &str, port: u16) -> Result<Regex, ProtocolError> {
    let source = format!(
        r"^(?P<at>\d+) {}:{port} LE_ALL (?P<logline>.*)",
        regex::escape(ip)
    );
    compile(source)
}

/// Pattern matching log events of any node.
///
/// Captures `at`, `ip`, `port` and `logline`.
pub fn any_log_pattern() -> Result<Regex, ProtocolError> {
    compile(r"^(?P<at>\d+) (?P<ip>[^:]+):(?P<port>[^ ]+) LE_ALL (?P<logline>.*)".to_string())
}

/// Pattern matching any record from `ip:port` that contains `pattern`.
///
/// `pattern` is a caller-supplied regular expression; it is grouped so an
/// alternation inside it cannot escape the address prefix.
pub fn expect_pattern(ip: &str, port: u16, pattern: &str) -> Result<Regex, ProtocolError> {
    let source = format!(
        r"^(?P<at>\d+) {}:{port} .*(?:{pattern})",
        regex::escape(ip)
    );
    Regex::new(&source).map_err(|source| ProtocolError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile(source: String) -> Result<Regex, ProtocolError> {
    Regex::new(&source).map_err(|e| ProtocolError::InvalidPattern {
        pattern: source,
        source: e,
    })
}

// ============================================================================
// Matched Lines
// ============================================================================

/// A line that matched a pattern, with its named captures.
///
/// Owned so handlers can keep it beyond the dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    /// The raw record, without its terminator
    pub line: String,

    /// Named capture groups that participated in the match
    pub fields: HashMap<String, String>,
}

impl LineMatch {
    /// Matches `line` against `pattern`; `None` if it does not match.
    pub fn capture(pattern: &Regex, line: &str) -> Option<Self> {
        let captures = pattern.captures(line)?;
        let fields = pattern
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();
        Some(Self {
            line: line.to_string(),
            fields,
        })
    }

    /// Returns a captured field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

// ============================================================================
// Typed Frames
// ============================================================================

/// A ping frame: liveness and status of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
    pub at_millis: u64,
    pub ip: String,
    pub port: u16,
    /// Frame type token (e.g., `TELOSB`)
    pub kind: String,
    /// Application session id, present while an app runs on the node
    pub app_id: Option<String>,
    /// `key=value` pairs of the attribute block, in order
    pub attributes: Vec<(String, String)>,
}

impl PingFrame {
    /// Builds a frame from a match of [`ping_pattern`].
    ///
    /// Returns `None` if a mandatory field is missing or malformed.
    pub fn from_match(m: &LineMatch) -> Option<Self> {
        let kind = m.field("type")?;
        if kind == LOG_EVENT_TYPE {
            return None;
        }
        Some(Self {
            at_millis: m.field("at")?.parse().ok()?,
            ip: m.field("ip")?.to_string(),
            port: m.field("port")?.parse().ok()?,
            kind: kind.to_string(),
            app_id: m
                .field("id")
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            attributes: parse_attributes(m.field("attributes").unwrap_or_default()),
        })
    }
}

/// A log event emitted by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub record: LogRecord,
}

impl LogLine {
    /// Builds a log line from a match of [`log_pattern`] or [`any_log_pattern`].
    pub fn from_match(m: &LineMatch) -> Option<Self> {
        let record = LogRecord::from_fields(m.line.clone(), m.field("at")?, m.field("logline")?).ok()?;
        Some(Self {
            ip: m.field("ip").map(str::to_string),
            port: m.field("port").and_then(|p| p.parse().ok()),
            record,
        })
    }
}

fn parse_attributes(block: &str) -> Vec<(String, String)> {
    block
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (pair.trim().to_string(), String::new()),
        })
        .collect()
}
