//! Stage identities and per-entry catalog metadata.

use serde::{Deserialize, Serialize};

/// One discrete handshake or discovery step in a node's initialization.
///
/// The set is closed: adding a stage means adding a variant here and an
/// executor arm in `executor::StageExecutor::execute`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EmptyNode,
    ProtocolInfo,
    FailedCheck,
    Ping,
    Details,
    SecurityReport,
    Manufacturer,
    Version,
    Endpoints,
    Associations,
    SetLifeline,
    Configuration,
    StaticEnd,
    SessionStart,
    DynamicValues,
    DeleteRoutes,
    ReturnRoutes,
    Neighbors,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 19] = [
        Stage::EmptyNode,
        Stage::ProtocolInfo,
        Stage::FailedCheck,
        Stage::Ping,
        Stage::Details,
        Stage::SecurityReport,
        Stage::Manufacturer,
        Stage::Version,
        Stage::Endpoints,
        Stage::Associations,
        Stage::SetLifeline,
        Stage::Configuration,
        Stage::StaticEnd,
        Stage::SessionStart,
        Stage::DynamicValues,
        Stage::DeleteRoutes,
        Stage::ReturnRoutes,
        Stage::Neighbors,
        Stage::Done,
    ];

    /// Convert to string for database storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::EmptyNode => "empty_node",
            Stage::ProtocolInfo => "protocol_info",
            Stage::FailedCheck => "failed_check",
            Stage::Ping => "ping",
            Stage::Details => "details",
            Stage::SecurityReport => "security_report",
            Stage::Manufacturer => "manufacturer",
            Stage::Version => "version",
            Stage::Endpoints => "endpoints",
            Stage::Associations => "associations",
            Stage::SetLifeline => "set_lifeline",
            Stage::Configuration => "configuration",
            Stage::StaticEnd => "static_end",
            Stage::SessionStart => "session_start",
            Stage::DynamicValues => "dynamic_values",
            Stage::DeleteRoutes => "delete_routes",
            Stage::ReturnRoutes => "return_routes",
            Stage::Neighbors => "neighbors",
            Stage::Done => "done",
        }
    }

    /// Dense index into per-stage tables.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Behavioural flags attached to a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    /// Permanent failure of this stage fails the node.
    pub mandatory: bool,
    /// Successful result is stored and skipped on resume. Non-persisted
    /// stages re-run every session and, past the heal marker, every heal.
    pub persisted: bool,
}

impl StageFlags {
    pub const fn mandatory_static() -> Self {
        Self {
            mandatory: true,
            persisted: true,
        }
    }

    pub const fn mandatory_dynamic() -> Self {
        Self {
            mandatory: true,
            persisted: false,
        }
    }

    pub const fn optional_static() -> Self {
        Self {
            mandatory: false,
            persisted: true,
        }
    }

    pub const fn optional_dynamic() -> Self {
        Self {
            mandatory: false,
            persisted: false,
        }
    }
}

/// How far a stage's traffic travels, which selects its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reach {
    /// Answered by the local controller or a direct neighbour.
    Local,
    /// May be forwarded through repeaters.
    Routed,
}

/// A catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: Stage,
    pub order: u32,
    pub flags: StageFlags,
    pub reach: Reach,
}

impl StageSpec {
    pub const fn new(stage: Stage, order: u32, flags: StageFlags, reach: Reach) -> Self {
        Self {
            stage,
            order,
            flags,
            reach,
        }
    }

    pub fn is_mandatory(&self) -> bool {
        self.flags.mandatory
    }

    pub fn is_persisted(&self) -> bool {
        self.flags.persisted
    }
}
