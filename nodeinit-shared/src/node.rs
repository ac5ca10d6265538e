//! Node addressing.

use serde::{Deserialize, Serialize};

/// Network address of a node on the mesh.
///
/// Opaque to the engine apart from ordering and display. Address 0 is never
/// assigned to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u16);

impl NodeId {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// Whether this id can address a real node.
    pub const fn is_assignable(self) -> bool {
        self.0 != 0
    }
}

impl From<u16> for NodeId {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .map(Self)
            .map_err(|e| format!("invalid node id '{}': {}", s, e))
    }
}
