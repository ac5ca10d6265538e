//! Request and response frames exchanged with the transport.
//!
//! Frames are deliberately thin: a function identifier plus an opaque
//! payload. Encoding them for a particular radio stack is the transport's
//! job.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command class identifiers the engine inspects in a node information frame.
pub mod command_class {
    pub const BASIC: u8 = 0x20;
    pub const SWITCH_BINARY: u8 = 0x25;
    pub const MULTI_CHANNEL: u8 = 0x60;
    pub const CONFIGURATION: u8 = 0x70;
    pub const ASSOCIATION: u8 = 0x85;
    pub const VERSION: u8 = 0x86;
    pub const SECURITY: u8 = 0x98;
}

/// Function requested from a node or from the local controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionId {
    NoOperation,
    ProtocolInfo,
    IsFailedNode,
    NodeInfo,
    SecurityCommandsGet,
    ManufacturerSpecificGet,
    VersionGet,
    MultiChannelEndpointGet,
    AssociationGroupingsGet,
    AssociationGet,
    AssociationSet,
    ConfigurationGet,
    ValuesGet,
    DeleteReturnRoutes,
    AssignReturnRoute,
    NeighborUpdate,
}

impl FunctionId {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionId::NoOperation => "no_operation",
            FunctionId::ProtocolInfo => "protocol_info",
            FunctionId::IsFailedNode => "is_failed_node",
            FunctionId::NodeInfo => "node_info",
            FunctionId::SecurityCommandsGet => "security_commands_get",
            FunctionId::ManufacturerSpecificGet => "manufacturer_specific_get",
            FunctionId::VersionGet => "version_get",
            FunctionId::MultiChannelEndpointGet => "multi_channel_endpoint_get",
            FunctionId::AssociationGroupingsGet => "association_groupings_get",
            FunctionId::AssociationGet => "association_get",
            FunctionId::AssociationSet => "association_set",
            FunctionId::ConfigurationGet => "configuration_get",
            FunctionId::ValuesGet => "values_get",
            FunctionId::DeleteReturnRoutes => "delete_return_routes",
            FunctionId::AssignReturnRoute => "assign_return_route",
            FunctionId::NeighborUpdate => "neighbor_update",
        }
    }

    /// Functions answered by the local controller without radio traffic to
    /// the node itself.
    pub fn is_controller_local(&self) -> bool {
        matches!(
            self,
            FunctionId::ProtocolInfo | FunctionId::IsFailedNode | FunctionId::DeleteReturnRoutes
        )
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub function: FunctionId,
    pub payload: Vec<u8>,
}

impl RequestFrame {
    pub fn new(function: FunctionId) -> Self {
        Self {
            function,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(function: FunctionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            function,
            payload: payload.into(),
        }
    }
}

impl std::fmt::Display for RequestFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.function, hex::encode(&self.payload))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub function: FunctionId,
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    pub fn new(function: FunctionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            function,
            payload: payload.into(),
        }
    }

    /// First payload byte, the status/flag byte for most functions.
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

impl std::fmt::Display for ResponseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.function, hex::encode(&self.payload))
    }
}

/// Outcome of a failed `send`.
///
/// Transports must keep these cases apart: the engine retries the first
/// three and treats an explicit rejection as permanent for the stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing came back within the caller's timeout.
    #[error("no response within {timeout_ms}ms")]
    NoResponse { timeout_ms: u64 },

    /// A response arrived but failed checksum or framing validation.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The node answered with an explicit error, e.g. unsupported command class.
    #[error("rejected by node: {0}")]
    Rejected(String),

    /// The node or controller is busy or still waiting for an ack.
    #[error("node busy")]
    Busy,
}
