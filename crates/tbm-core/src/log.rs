//! Per-node log records and the bounded ring that keeps them.

use std::collections::VecDeque;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Default number of log records retained per node.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Timestamp format used when rendering log records.
const TAIL_DATE_FMT: &str = "%y-%m-%d %H:%M:%S";

/// One log event observed for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// The line as received from the site manager
    pub raw: String,

    /// Site manager timestamp, milliseconds since the Unix epoch
    pub at_millis: u64,

    /// Free-form text emitted by the node
    pub text: String,
}

impl LogRecord {
    /// Builds a record from the captured `at` and `logline` fields.
    pub fn from_fields(raw: impl Into<String>, at: &str, text: impl Into<String>) -> DomainResult<Self> {
        let at_millis = at.parse::<u64>().map_err(|e| DomainError::ParseError {
            field: "at".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: raw.into(),
            at_millis,
            text: text.into(),
        })
    }

    /// Renders the record as `[yy-mm-dd HH:MM:SS <who>] <text>` in local time.
    ///
    /// `who` is right-aligned to 25 columns so tails of several nodes line up.
    pub fn render(&self, who: &str) -> String {
        let millis = i64::try_from(self.at_millis).unwrap_or(i64::MAX);
        let stamp = Local
            .timestamp_millis_opt(millis)
            .single()
            .map(|t| t.format(TAIL_DATE_FMT).to_string())
            .unwrap_or_else(|| "??-??-?? ??:??:??".to_string());
        format!("[{stamp} {who:>25}] {}", self.text)
    }

    /// Placeholder line used when a node has no output to show.
    pub fn placeholder(who: &str) -> String {
        format!("[{who:>25}] <<NO OUTPUT>>")
    }
}

/// Fixed-capacity log buffer that drops the oldest record when full.
#[derive(Debug, Clone)]
pub struct LogRing {
    records: VecDeque<LogRecord>,
    capacity: usize,
}

impl LogRing {
    /// Creates an empty ring holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a record, evicting the oldest one at capacity.
    pub fn push(&mut self, record: LogRecord) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Returns up to `n` most recent records, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: u64) -> LogRecord {
        LogRecord {
            raw: format!("{i} 10.0.0.1:5000 LE_ALL line {i}"),
            at_millis: i,
            text: format!("line {i}"),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(record(i));
        }

        assert_eq!(ring.len(), 3);
        let texts: Vec<_> = ring.tail(10).into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_tail_returns_most_recent_oldest_first() {
        let mut ring = LogRing::default();
        for i in 0..10 {
            ring.push(record(i));
        }

        let texts: Vec<_> = ring.tail(2).into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["line 8", "line 9"]);
    }

    #[test]
    fn test_tail_of_empty_ring() {
        let ring = LogRing::new(5);
        assert!(ring.tail(3).is_empty());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut ring = LogRing::new(0);
        ring.push(record(1));
        ring.push(record(2));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.tail(5).len(), 1);
    }

    #[test]
    fn test_from_fields_parses_millis() {
        let rec = LogRecord::from_fields("raw", "1400000000123", "hello").unwrap();
        assert_eq!(rec.at_millis, 1_400_000_000_123);
        assert_eq!(rec.text, "hello");
    }

    #[test]
    fn test_from_fields_rejects_bad_millis() {
        assert!(LogRecord::from_fields("raw", "soon", "hello").is_err());
    }

    #[test]
    fn test_render_layout() {
        let rec = LogRecord::from_fields("raw", "0", "booted").unwrap();
        let line = rec.render("a1@10.0.0.1");

        assert!(line.starts_with('['));
        assert!(line.ends_with("] booted"));
        assert!(line.contains(&format!("{:>25}", "a1@10.0.0.1")));
    }

    #[test]
    fn test_placeholder() {
        assert_eq!(
            LogRecord::placeholder("a1@?"),
            format!("[{:>25}] <<NO OUTPUT>>", "a1@?")
        );
    }
}
