//! Node lifecycle mode and its state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle mode of a node session.
///
/// State machine:
/// ```text
/// include   → Initializing (walks the catalog)
/// terminal  → Ready
/// heal      → Healing (walks the heal subset) → Ready
/// mandatory stage fails permanently → Failed (until re-inclusion)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Initializing,
    Ready,
    Healing,
    Failed,
}

impl NodeMode {
    /// A stage still has to run in this mode.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeMode::Initializing | NodeMode::Healing)
    }

    /// Nothing further happens without an external trigger.
    pub fn is_settled(&self) -> bool {
        matches!(self, NodeMode::Ready | NodeMode::Failed)
    }

    /// A heal may only start from Ready.
    pub fn can_heal(&self) -> bool {
        matches!(self, NodeMode::Ready)
    }

    pub fn can_transition_to(&self, target: NodeMode) -> bool {
        use NodeMode::*;
        matches!(
            (self, target),
            (Initializing, Initializing)
                | (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, Healing)
                // Administrative force-fail
                | (Ready, Failed)
                | (Healing, Healing)
                | (Healing, Ready)
                | (Healing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Initializing => "initializing",
            NodeMode::Ready => "ready",
            NodeMode::Healing => "healing",
            NodeMode::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NodeMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(NodeMode::Initializing),
            "ready" => Ok(NodeMode::Ready),
            "healing" => Ok(NodeMode::Healing),
            "failed" => Ok(NodeMode::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for NodeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
