//! Attribute-based node selection.

use std::fmt;

use glob::Pattern;

use crate::error::{MonitorError, Result};
use crate::node::Node;

/// How one attribute value is compared.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Shell-style wildcard (`*`, `?`, `[...]`)
    Glob(Pattern),
    Exact(String),
}

impl Matcher {
    /// Compiles a wildcard pattern.
    pub fn glob(pattern: &str) -> Result<Self> {
        Pattern::new(pattern)
            .map(Self::Glob)
            .map_err(|e| MonitorError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Glob(pattern) => pattern.matches(value),
            Self::Exact(expected) => expected == value,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glob(pattern) => write!(f, "{}", pattern.as_str()),
            Self::Exact(value) => write!(f, "{value}"),
        }
    }
}

/// A conjunction of attribute criteria.
///
/// A node is selected when every named attribute exists on it and matches.
/// An empty selector selects every node.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    criteria: Vec<(String, Matcher)>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a wildcard criterion.
    pub fn glob(mut self, attribute: &str, pattern: &str) -> Result<Self> {
        self.criteria
            .push((attribute.to_string(), Matcher::glob(pattern)?));
        Ok(self)
    }

    /// Adds an exact-value criterion.
    #[must_use]
    pub fn exact(mut self, attribute: &str, value: impl Into<String>) -> Self {
        self.criteria
            .push((attribute.to_string(), Matcher::Exact(value.into())));
        self
    }

    /// Parses a `name=pattern` criterion and adds it as a wildcard.
    pub fn with_criterion(self, criterion: &str) -> Result<Self> {
        let (attribute, pattern) =
            criterion
                .split_once('=')
                .ok_or_else(|| MonitorError::InvalidPattern {
                    pattern: criterion.to_string(),
                    reason: "expected name=pattern".to_string(),
                })?;
        self.glob(attribute.trim(), pattern.trim())
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.criteria.iter().all(|(attribute, matcher)| {
            node.attribute(attribute)
                .is_some_and(|value| matcher.matches(&value))
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .criteria
            .iter()
            .map(|(attribute, matcher)| format!("{attribute}={matcher}"))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::node::tests::context;
    use tbm_core::NodeDescriptor;

    fn node(bus: &EventBus, gid: &str, kind: &str) -> Node {
        Node::new(NodeDescriptor::new(gid, kind, "7", "0007"), context(bus)).unwrap()
    }

    #[test]
    fn test_glob_matcher() {
        let m = Matcher::glob("a[12]*").unwrap();
        assert!(m.matches("a1"));
        assert!(m.matches("a20"));
        assert!(!m.matches("a3"));
    }

    #[test]
    fn test_invalid_glob() {
        assert!(matches!(
            Matcher::glob("[a"),
            Err(MonitorError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_all_criteria_must_match() {
        let bus = EventBus::new();
        let telosb = node(&bus, "a1", "telosb");
        let other = node(&bus, "a2", "other");

        let selector = Selector::new()
            .glob("gid", "a*")
            .unwrap()
            .exact("type", "telosb");
        assert!(selector.matches(&telosb));
        assert!(!selector.matches(&other));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let bus = EventBus::new();
        let other = node(&bus, "a2", "other");

        // rime only exists on TelosB nodes, ip only once seen
        assert!(!Selector::new().glob("rime", "*").unwrap().matches(&other));
        assert!(!Selector::new().glob("ip", "*").unwrap().matches(&other));
        assert!(Selector::new().matches(&other));
    }

    #[test]
    fn test_parse_criterion() {
        let selector = Selector::new().with_criterion("type=tel*").unwrap();
        assert_eq!(selector.to_string(), "type=tel*");
        assert!(Selector::new().with_criterion("type").is_err());
    }
}
