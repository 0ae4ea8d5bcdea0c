//! Node identity and roster descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Global identifier of a testbed node (e.g., "n042").
///
/// Taken verbatim from the roster and embedded by the site manager in every
/// ping frame of that node. Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gid(String);

impl Gid {
    /// Creates a new Gid from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Gid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Gid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Gid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Node Kind
// ============================================================================

/// Hardware type of a node as written in the roster.
///
/// The monitor does not interpret node types beyond exposing them for
/// selection; `TelosB` is singled out because it carries a rime address
/// and has a programming/reset action implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// TelosB / Tmote Sky sensor node
    TelosB,

    /// Any other roster type, kept verbatim
    Other(String),
}

impl NodeKind {
    /// Parses a roster type token. Matching of `telosb` is case-insensitive.
    pub fn from_roster(token: &str) -> Self {
        if token.eq_ignore_ascii_case("telosb") {
            Self::TelosB
        } else {
            Self::Other(token.to_string())
        }
    }

    /// Returns true for TelosB nodes.
    pub fn is_telosb(&self) -> bool {
        matches!(self, Self::TelosB)
    }
}

// ============================================================================
// Node Descriptor
// ============================================================================

/// One parsed roster record: `gid type tos_id rime_addr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node identity
    pub gid: Gid,

    /// Type token exactly as written in the roster
    pub type_name: String,

    /// Parsed kind
    pub kind: NodeKind,

    /// TinyOS node id
    pub tos_id: String,

    /// Rime address (meaningful for TelosB nodes only)
    pub rime_addr: String,

    /// 1-based roster line this record came from
    pub line: usize,
}

impl NodeDescriptor {
    /// Creates a descriptor; the kind is derived from `type_name`.
    pub fn new(
        gid: impl Into<Gid>,
        type_name: impl Into<String>,
        tos_id: impl Into<String>,
        rime_addr: impl Into<String>,
    ) -> Self {
        let type_name = type_name.into();
        Self {
            gid: gid.into(),
            kind: NodeKind::from_roster(&type_name),
            type_name,
            tos_id: tos_id.into(),
            rime_addr: rime_addr.into(),
            line: 0,
        }
    }

    /// Sets the roster line number.
    #[must_use]
    pub fn at_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    /// Looks up a static attribute by name for node selection.
    ///
    /// Known names: `gid`, `type`, `tos_id`, and `rime` (TelosB only).
    /// Returns `None` for unknown names so selections on them never match.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "gid" => Some(self.gid.to_string()),
            "type" => Some(self.type_name.clone()),
            "tos_id" => Some(self.tos_id.clone()),
            "rime" if self.kind.is_telosb() => Some(self.rime_addr.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_roster() {
        assert_eq!(NodeKind::from_roster("telosb"), NodeKind::TelosB);
        assert_eq!(NodeKind::from_roster("TelosB"), NodeKind::TelosB);
        assert_eq!(
            NodeKind::from_roster("other"),
            NodeKind::Other("other".to_string())
        );
    }

    #[test]
    fn test_descriptor_attributes() {
        let desc = NodeDescriptor::new("a1", "telosb", "1", "0001");
        assert_eq!(desc.attribute("gid").as_deref(), Some("a1"));
        assert_eq!(desc.attribute("type").as_deref(), Some("telosb"));
        assert_eq!(desc.attribute("tos_id").as_deref(), Some("1"));
        assert_eq!(desc.attribute("rime").as_deref(), Some("0001"));
        assert_eq!(desc.attribute("colour"), None);
    }

    #[test]
    fn test_rime_only_for_telosb() {
        let desc = NodeDescriptor::new("a3", "other", "3", "0003");
        assert_eq!(desc.attribute("rime"), None);
    }

    #[test]
    fn test_gid_serializes_transparently() {
        let json = serde_json::to_string(&Gid::new("n7")).unwrap();
        assert_eq!(json, "\"n7\"");
    }
}
