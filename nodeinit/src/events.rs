//! Lifecycle notifications emitted by the scheduler.

use crate::catalog::Stage;
use crate::executor::FailureReason;
use crate::session::NodeMode;
use nodeinit_shared::NodeId;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The session moved from one stage to another, including skips and the
    /// jump to the first heal stage.
    NodeStageAdvanced { node_id: NodeId, from: Stage, to: Stage },
    NodeReady { node_id: NodeId },
    /// Emitted once per failure.
    NodeFailed {
        node_id: NodeId,
        stage: Stage,
        reason: FailureReason,
    },
    /// A heal walk finished. `failed_stages` did not succeed.
    NodeHealCompleted {
        node_id: NodeId,
        failed_stages: Vec<Stage>,
    },
}

impl NodeEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            NodeEvent::NodeStageAdvanced { node_id, .. }
            | NodeEvent::NodeReady { node_id }
            | NodeEvent::NodeFailed { node_id, .. }
            | NodeEvent::NodeHealCompleted { node_id, .. } => *node_id,
        }
    }
}

/// Receiver of [`NodeEvent`]s.
///
/// Called from scheduler tasks while the node's lock is held, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: NodeEvent);

    /// A session was attached in `Initializing`, or entered `Healing`.
    /// No event carries these changes.
    fn mode_changed(&self, _node_id: NodeId, _mode: NodeMode) {}
}

/// Drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: NodeEvent) {}
}

/// Delivers each event to every sink in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: NodeEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }

    fn mode_changed(&self, node_id: NodeId, mode: NodeMode) {
        for sink in &self.sinks {
            sink.mode_changed(node_id, mode);
        }
    }
}
