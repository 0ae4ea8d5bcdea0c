//! Roster file parsing.
//!
//! A roster lists one node per line as whitespace-separated fields:
//!
//! ```text
//! # gid   type    tos_id  rime_addr
//! n001    telosb  1       01.00
//! n002    telosb  2       02.00
//! ```
//!
//! Everything after `#` is a comment and blank lines are skipped. Any other
//! line that does not carry four fields aborts loading.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::{Gid, NodeDescriptor, RosterError};

/// Number of mandatory fields on a roster line.
const ROSTER_FIELDS: usize = 4;

/// Parses roster text into descriptors, in file order.
pub fn parse_roster(text: &str) -> Result<Vec<NodeDescriptor>, RosterError> {
    let mut nodes = Vec::new();
    let mut seen: HashMap<Gid, usize> = HashMap::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.split('#').next().unwrap_or_default();
        if content.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = content.split_whitespace().collect();
        let (gid, type_name, tos_id, rime_addr) = match fields.as_slice() {
            [gid, type_name, tos_id, rime_addr, rest @ ..] => {
                if !rest.is_empty() {
                    debug!(line, extra = rest.len(), "Ignoring trailing roster fields");
                }
                (*gid, *type_name, *tos_id, *rime_addr)
            }
            _ => {
                return Err(RosterError::Malformed {
                    line,
                    reason: format!(
                        "expected {ROSTER_FIELDS} fields (gid type tos_id rime_addr), found {}",
                        fields.len()
                    ),
                });
            }
        };

        let gid = Gid::new(gid);
        if let Some(first) = seen.get(&gid) {
            return Err(RosterError::DuplicateGid {
                gid,
                line,
                first: *first,
            });
        }
        seen.insert(gid.clone(), line);

        nodes.push(NodeDescriptor::new(gid, type_name, tos_id, rime_addr).at_line(line));
    }

    debug!(count = nodes.len(), "Parsed roster");
    Ok(nodes)
}

/// Reads and parses a roster file.
pub fn load_roster(path: impl AsRef<Path>) -> Result<Vec<NodeDescriptor>, RosterError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| RosterError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_roster(&text)
}
