//! Transport seam.
//!
//! The engine never touches a radio. It hands request frames to a
//! `NodeTransport` and interprets whatever comes back. Implementations must
//! serialize access to a shared physical channel themselves (one request in
//! flight per channel, FIFO); the engine only guarantees one request in
//! flight per node.

mod simulated;

pub use simulated::{MeshProfile, NodeProfile, SimulatedMesh};

use async_trait::async_trait;
use nodeinit_shared::{NodeId, RequestFrame, ResponseFrame, TransportError};
use std::time::Duration;

#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Send `request` to `node` and wait at most `timeout` for its response.
    async fn send(
        &self,
        node: NodeId,
        request: RequestFrame,
        timeout: Duration,
    ) -> Result<ResponseFrame, TransportError>;
}
