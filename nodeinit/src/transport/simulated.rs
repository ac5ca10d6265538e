//! In-process mesh used by the `nodeinit-sim` binary and tests.
//!
//! Every node answers from a [`NodeProfile`]. Loss, busy replies and latency
//! come from the [`MeshProfile`]. One `tokio::sync::Mutex` stands in for the
//! radio: it is fair, so requests go out in arrival order.

use super::NodeTransport;
use async_trait::async_trait;
use nodeinit_shared::frame::command_class;
use nodeinit_shared::{FunctionId, NodeId, RequestFrame, ResponseFrame, TransportError};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Channel characteristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshProfile {
    /// Probability in `[0, 1]` that a routed frame gets no answer.
    pub loss_rate: f64,
    /// Probability in `[0, 1]` that a routed frame gets a busy reply.
    pub busy_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for MeshProfile {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            busy_rate: 0.0,
            min_latency_ms: 2,
            max_latency_ms: 10,
        }
    }
}

impl MeshProfile {
    /// A channel that always answers immediately.
    pub fn perfect() -> Self {
        Self {
            loss_rate: 0.0,
            busy_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
        }
    }
}

/// What one simulated node knows about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeProfile {
    pub command_classes: Vec<u8>,
    pub manufacturer: [u8; 6],
    pub firmware: Vec<u8>,
    pub endpoints: u8,
    pub neighbors: Vec<u16>,
    /// Whether the node is asleep or out of range.
    pub reachable: bool,
    /// Whether the controller lists the node as failed.
    pub marked_failed: bool,
}

impl Default for NodeProfile {
    fn default() -> Self {
        Self {
            command_classes: vec![
                command_class::BASIC,
                command_class::SWITCH_BINARY,
                command_class::CONFIGURATION,
                command_class::ASSOCIATION,
                command_class::VERSION,
            ],
            manufacturer: [0x00, 0x86, 0x00, 0x03, 0x00, 0x60],
            firmware: vec![0x03, 0x01, 0x1c],
            endpoints: 0,
            neighbors: vec![1],
            reachable: true,
            marked_failed: false,
        }
    }
}

struct SimNode {
    profile: NodeProfile,
    /// Association group -> member node ids.
    groups: HashMap<u8, BTreeSet<u16>>,
    level: u8,
}

impl SimNode {
    fn new(profile: NodeProfile) -> Self {
        Self {
            profile,
            groups: HashMap::new(),
            level: 0,
        }
    }
}

/// What the channel decided for one routed frame.
enum Fate {
    Deliver(Duration),
    Lost,
    Busy(Duration),
}

pub struct SimulatedMesh {
    profile: MeshProfile,
    nodes: Mutex<HashMap<NodeId, SimNode>>,
    channel: tokio::sync::Mutex<()>,
    frames_sent: AtomicU64,
}

impl SimulatedMesh {
    pub fn new(profile: MeshProfile) -> Self {
        Self {
            profile,
            nodes: Mutex::new(HashMap::new()),
            channel: tokio::sync::Mutex::new(()),
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn add_node(&self, node: NodeId, profile: NodeProfile) {
        self.nodes.lock().insert(node, SimNode::new(profile));
    }

    pub fn remove_node(&self, node: NodeId) -> bool {
        self.nodes.lock().remove(&node).is_some()
    }

    /// Put a node to sleep or wake it up.
    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        if let Some(sim) = self.nodes.lock().get_mut(&node) {
            sim.profile.reachable = reachable;
        }
    }

    /// Current members of one association group.
    pub fn group_members(&self, node: NodeId, group: u8) -> Vec<NodeId> {
        self.nodes
            .lock()
            .get(&node)
            .and_then(|sim| sim.groups.get(&group))
            .map(|members| members.iter().copied().map(NodeId::new).collect())
            .unwrap_or_default()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    fn roll(&self) -> Fate {
        let mut rng = rand::rng();
        let latency = if self.profile.max_latency_ms > self.profile.min_latency_ms {
            rng.random_range(self.profile.min_latency_ms..=self.profile.max_latency_ms)
        } else {
            self.profile.min_latency_ms
        };
        let latency = Duration::from_millis(latency);

        if self.profile.loss_rate > 0.0 && rng.random_bool(self.profile.loss_rate.min(1.0)) {
            Fate::Lost
        } else if self.profile.busy_rate > 0.0 && rng.random_bool(self.profile.busy_rate.min(1.0))
        {
            Fate::Busy(latency)
        } else {
            Fate::Deliver(latency)
        }
    }

    fn answer(&self, node: NodeId, request: &RequestFrame) -> Result<ResponseFrame, TransportError> {
        let mut nodes = self.nodes.lock();
        let sim = nodes
            .get_mut(&node)
            .ok_or_else(|| TransportError::Rejected(format!("node {} is not in the network", node)))?;
        let function = request.function;

        let payload = match function {
            FunctionId::NoOperation => Vec::new(),
            FunctionId::ProtocolInfo => vec![0xd3, 0x9c, 0x01, 0x04, 0x10, 0x01],
            FunctionId::IsFailedNode => vec![u8::from(sim.profile.marked_failed)],
            FunctionId::NodeInfo => sim.profile.command_classes.clone(),
            FunctionId::SecurityCommandsGet => {
                require_class(sim, command_class::SECURITY)?;
                vec![command_class::BASIC, command_class::SWITCH_BINARY]
            }
            FunctionId::ManufacturerSpecificGet => sim.profile.manufacturer.to_vec(),
            FunctionId::VersionGet => {
                require_class(sim, command_class::VERSION)?;
                sim.profile.firmware.clone()
            }
            FunctionId::MultiChannelEndpointGet => {
                require_class(sim, command_class::MULTI_CHANNEL)?;
                vec![sim.profile.endpoints]
            }
            FunctionId::AssociationGroupingsGet => {
                require_class(sim, command_class::ASSOCIATION)?;
                vec![1]
            }
            FunctionId::AssociationGet => {
                require_class(sim, command_class::ASSOCIATION)?;
                let group = request.payload.first().copied().unwrap_or(1);
                sim.groups
                    .get(&group)
                    .map(|members| members.iter().flat_map(|m| m.to_be_bytes()).collect())
                    .unwrap_or_default()
            }
            FunctionId::AssociationSet => {
                require_class(sim, command_class::ASSOCIATION)?;
                match request.payload.as_slice() {
                    [group, hi, lo, ..] => {
                        sim.groups
                            .entry(*group)
                            .or_default()
                            .insert(u16::from_be_bytes([*hi, *lo]));
                    }
                    _ => {
                        return Err(TransportError::Rejected(
                            "association set needs group and node".into(),
                        ));
                    }
                }
                Vec::new()
            }
            FunctionId::ConfigurationGet => {
                require_class(sim, command_class::CONFIGURATION)?;
                vec![0x01, 0x01, 0x00]
            }
            FunctionId::ValuesGet => {
                sim.level = sim.level.wrapping_add(1);
                vec![sim.level]
            }
            FunctionId::DeleteReturnRoutes | FunctionId::AssignReturnRoute => Vec::new(),
            FunctionId::NeighborUpdate => sim
                .profile
                .neighbors
                .iter()
                .flat_map(|n| n.to_be_bytes())
                .collect(),
        };

        Ok(ResponseFrame::new(function, payload))
    }

    fn is_reachable(&self, node: NodeId) -> bool {
        self.nodes
            .lock()
            .get(&node)
            .is_some_and(|sim| sim.profile.reachable)
    }
}

fn require_class(sim: &SimNode, class: u8) -> Result<(), TransportError> {
    if sim.profile.command_classes.contains(&class) {
        Ok(())
    } else {
        Err(TransportError::Rejected(format!(
            "command class {:#04x} not supported",
            class
        )))
    }
}

#[async_trait]
impl NodeTransport for SimulatedMesh {
    async fn send(
        &self,
        node: NodeId,
        request: RequestFrame,
        timeout: Duration,
    ) -> Result<ResponseFrame, TransportError> {
        let timeout_ms = timeout.as_millis() as u64;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);

        if request.function.is_controller_local() {
            let _channel = self.channel.lock().await;
            return self.answer(node, &request);
        }

        let fate = self.roll();
        let lost = !self.is_reachable(node) || matches!(fate, Fate::Lost);
        if lost {
            tracing::trace!(node_id = %node, request = %request, "Frame lost");
            tokio::time::sleep(timeout).await;
            return Err(TransportError::NoResponse { timeout_ms });
        }

        let _channel = self.channel.lock().await;
        match fate {
            Fate::Busy(latency) => {
                tokio::time::sleep(latency).await;
                Err(TransportError::Busy)
            }
            Fate::Deliver(latency) if latency > timeout => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::NoResponse { timeout_ms })
            }
            Fate::Deliver(latency) => {
                tokio::time::sleep(latency).await;
                self.answer(node, &request)
            }
            Fate::Lost => Err(TransportError::NoResponse { timeout_ms }),
        }
    }
}
