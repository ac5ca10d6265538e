//! Thread-safe node registry.
//!
//! Folds [`NodeEvent`]s into one [`NodeRecord`] per node so callers can tell
//! a failed node from one still initializing, and fans the raw events out
//! to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use nodeinit_shared::{NodeId, NodeinitError, NodeinitResult};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::catalog::Stage;
use crate::events::{EventSink, NodeEvent};
use crate::session::NodeMode;

const EVENT_BUFFER: usize = 256;

/// Last known facts about one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub mode: NodeMode,
    pub last_stage: Option<Stage>,
    pub failed_stage: Option<Stage>,
    pub failure_reason: Option<String>,
    pub ready_at: Option<DateTime<Utc>>,
    pub heal_count: u64,
    pub last_heal_failures: Vec<Stage>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    fn new(node_id: NodeId, mode: NodeMode) -> Self {
        Self {
            node_id,
            mode,
            last_stage: None,
            failed_stage: None,
            failure_reason: None,
            ready_at: None,
            heal_count: 0,
            last_heal_failures: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    fn apply(&mut self, event: &NodeEvent) {
        match event {
            NodeEvent::NodeStageAdvanced { to, .. } => {
                self.last_stage = Some(*to);
            }
            NodeEvent::NodeReady { .. } => {
                self.mode = NodeMode::Ready;
                self.ready_at = Some(Utc::now());
            }
            NodeEvent::NodeFailed { stage, reason, .. } => {
                self.mode = NodeMode::Failed;
                self.last_stage = Some(*stage);
                self.failed_stage = Some(*stage);
                self.failure_reason = Some(reason.to_string());
            }
            NodeEvent::NodeHealCompleted { failed_stages, .. } => {
                self.mode = NodeMode::Ready;
                self.heal_count += 1;
                self.last_heal_failures = failed_stages.clone();
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Cloneable via `Arc`; the scheduler publishes into it and the runtime
/// reads from it.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<RwLock<HashMap<NodeId, NodeRecord>>>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry").finish()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Start (or restart) tracking a node in `mode`, discarding old facts.
    pub fn track(&self, node_id: NodeId, mode: NodeMode) -> NodeinitResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| NodeinitError::Internal(format!("registry lock poisoned: {}", e)))?;

        tracing::debug!(node_id = %node_id, mode = %mode, "Tracking node");
        inner.insert(node_id, NodeRecord::new(node_id, mode));
        Ok(())
    }

    /// Record a mode change that no event carries, such as the start of a heal.
    pub fn set_mode(&self, node_id: NodeId, mode: NodeMode) -> NodeinitResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| NodeinitError::Internal(format!("registry lock poisoned: {}", e)))?;

        let record = inner
            .get_mut(&node_id)
            .ok_or_else(|| NodeinitError::NotFound(format!("node {}", node_id)))?;
        record.mode = mode;
        record.updated_at = Utc::now();
        Ok(())
    }

    pub fn remove(&self, node_id: NodeId) -> NodeinitResult<Option<NodeRecord>> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| NodeinitError::Internal(format!("registry lock poisoned: {}", e)))?;
        Ok(inner.remove(&node_id))
    }

    pub fn get(&self, node_id: NodeId) -> NodeinitResult<Option<NodeRecord>> {
        let inner = self
            .inner
            .read()
            .map_err(|e| NodeinitError::Internal(format!("registry lock poisoned: {}", e)))?;
        Ok(inner.get(&node_id).cloned())
    }

    /// Every tracked node, ordered by id.
    pub fn list(&self) -> NodeinitResult<Vec<NodeRecord>> {
        let inner = self
            .inner
            .read()
            .map_err(|e| NodeinitError::Internal(format!("registry lock poisoned: {}", e)))?;
        let mut records: Vec<NodeRecord> = inner.values().cloned().collect();
        records.sort_by_key(|record| record.node_id);
        Ok(records)
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}

impl EventSink for NodeRegistry {
    fn publish(&self, event: NodeEvent) {
        let node_id = event.node_id();
        match self.inner.write() {
            Ok(mut inner) => {
                // Events for a node no longer tracked come from a cancelled
                // worker and are dropped.
                match inner.get_mut(&node_id) {
                    Some(record) => record.apply(&event),
                    None => {
                        tracing::trace!(node_id = %node_id, event = ?event, "Dropping event for untracked node");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "Registry lock poisoned, dropping event");
                return;
            }
        }

        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn mode_changed(&self, node_id: NodeId, mode: NodeMode) {
        // A node resumed as failed has no record yet.
        let result = match mode {
            NodeMode::Initializing => self.track(node_id, mode),
            _ => match self.set_mode(node_id, mode) {
                Err(NodeinitError::NotFound(_)) => self.track(node_id, mode),
                other => other,
            },
        };
        if let Err(e) = result {
            tracing::warn!(node_id = %node_id, mode = %mode, error = %e, "Failed to record mode change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FailureReason;

    #[test]
    fn folds_events_into_record() {
        let registry = NodeRegistry::new();
        let node_id = NodeId::new(5);
        registry.track(node_id, NodeMode::Initializing).unwrap();

        registry.publish(NodeEvent::NodeStageAdvanced {
            node_id,
            from: Stage::EmptyNode,
            to: Stage::ProtocolInfo,
        });
        let record = registry.get(node_id).unwrap().unwrap();
        assert_eq!(record.mode, NodeMode::Initializing);
        assert_eq!(record.last_stage, Some(Stage::ProtocolInfo));

        registry.publish(NodeEvent::NodeReady { node_id });
        let record = registry.get(node_id).unwrap().unwrap();
        assert_eq!(record.mode, NodeMode::Ready);
        assert!(record.ready_at.is_some());
    }

    #[test]
    fn failed_node_keeps_stage_and_reason() {
        let registry = NodeRegistry::new();
        let node_id = NodeId::new(5);
        registry.track(node_id, NodeMode::Initializing).unwrap();

        registry.publish(NodeEvent::NodeFailed {
            node_id,
            stage: Stage::Details,
            reason: FailureReason::NodeRejected("no".into()),
        });

        let record = registry.get(node_id).unwrap().unwrap();
        assert_eq!(record.mode, NodeMode::Failed);
        assert_eq!(record.failed_stage, Some(Stage::Details));
        assert_eq!(
            record.failure_reason.as_deref(),
            Some("node rejected request: no")
        );
    }

    #[test]
    fn heal_completion_counts_and_returns_to_ready() {
        let registry = NodeRegistry::new();
        let node_id = NodeId::new(5);
        registry.mode_changed(node_id, NodeMode::Initializing);
        registry.publish(NodeEvent::NodeReady { node_id });
        registry.mode_changed(node_id, NodeMode::Healing);
        assert_eq!(
            registry.get(node_id).unwrap().unwrap().mode,
            NodeMode::Healing
        );

        registry.publish(NodeEvent::NodeHealCompleted {
            node_id,
            failed_stages: vec![Stage::Neighbors],
        });

        let record = registry.get(node_id).unwrap().unwrap();
        assert_eq!(record.mode, NodeMode::Ready);
        assert_eq!(record.heal_count, 1);
        assert_eq!(record.last_heal_failures, vec![Stage::Neighbors]);
    }

    #[test]
    fn mode_change_tracks_unknown_node() {
        let registry = NodeRegistry::new();
        let node_id = NodeId::new(6);
        registry.mode_changed(node_id, NodeMode::Failed);
        assert_eq!(
            registry.get(node_id).unwrap().unwrap().mode,
            NodeMode::Failed
        );
    }

    #[test]
    fn untracked_events_are_dropped() {
        let registry = NodeRegistry::new();
        let mut rx = registry.subscribe();
        registry.publish(NodeEvent::NodeReady {
            node_id: NodeId::new(9),
        });
        assert!(registry.get(NodeId::new(9)).unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let registry = NodeRegistry::new();
        let node_id = NodeId::new(5);
        registry.track(node_id, NodeMode::Initializing).unwrap();
        let mut rx = registry.subscribe();

        registry.publish(NodeEvent::NodeReady { node_id });
        assert_eq!(rx.recv().await.unwrap(), NodeEvent::NodeReady { node_id });
    }

    #[test]
    fn list_is_ordered() {
        let registry = NodeRegistry::new();
        for id in [9, 2, 5] {
            registry.track(NodeId::new(id), NodeMode::Initializing).unwrap();
        }
        let ids: Vec<u16> = registry
            .list()
            .unwrap()
            .iter()
            .map(|r| r.node_id.get())
            .collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert!(registry.remove(NodeId::new(5)).unwrap().is_some());
        assert_eq!(registry.list().unwrap().len(), 2);
    }
}
