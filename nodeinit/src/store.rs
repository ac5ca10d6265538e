//! Persistence seam for static stage results.
//!
//! Only stages flagged `persisted` are ever written. Dynamic data lives in
//! the session and dies with the process. A permanent failure is stored too,
//! so a failed node stays failed across restarts until it is re-included.

use crate::catalog::{Stage, StaticData};
use nodeinit_shared::{NodeId, NodeinitResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

pub use crate::db::SqliteStaticStore;

/// Where and why a node failed, as kept by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFailure {
    pub stage: Stage,
    pub reason: String,
}

/// Durable storage keyed by node and stage.
///
/// Called from scheduler tasks with the node's lock held; writes for one
/// node are therefore never concurrent.
pub trait StaticDataStore: Send + Sync {
    /// Every stored stage result for `node`. Empty if none.
    fn load(&self, node: NodeId) -> NodeinitResult<StaticData>;

    /// Store or replace the result of one stage.
    fn save(&self, node: NodeId, stage: Stage, data: &[u8]) -> NodeinitResult<()>;

    /// Forget the node and everything stored for it, failure included.
    fn clear(&self, node: NodeId) -> NodeinitResult<()>;

    /// Record that the node failed for good. Registers it if needed.
    fn mark_failed(&self, node: NodeId, failure: &StoredFailure) -> NodeinitResult<()>;

    /// The failure recorded by `mark_failed`, if any.
    fn load_failure(&self, node: NodeId) -> NodeinitResult<Option<StoredFailure>>;

    /// Record that `node` is part of the network, even before any data exists.
    fn register(&self, node: NodeId) -> NodeinitResult<()>;

    /// Nodes registered and not cleared, in ascending order.
    fn list_nodes(&self) -> NodeinitResult<Vec<NodeId>>;
}

/// In-memory store for tests and ephemeral runtimes.
#[derive(Default)]
pub struct MemoryStaticStore {
    nodes: RwLock<BTreeMap<NodeId, StaticData>>,
    failures: RwLock<BTreeMap<NodeId, StoredFailure>>,
}

impl MemoryStaticStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StaticDataStore for MemoryStaticStore {
    fn load(&self, node: NodeId) -> NodeinitResult<StaticData> {
        Ok(self.nodes.read().get(&node).cloned().unwrap_or_default())
    }

    fn save(&self, node: NodeId, stage: Stage, data: &[u8]) -> NodeinitResult<()> {
        self.nodes
            .write()
            .entry(node)
            .or_default()
            .insert(stage, data.to_vec());
        Ok(())
    }

    fn clear(&self, node: NodeId) -> NodeinitResult<()> {
        self.nodes.write().remove(&node);
        self.failures.write().remove(&node);
        Ok(())
    }

    fn mark_failed(&self, node: NodeId, failure: &StoredFailure) -> NodeinitResult<()> {
        self.nodes.write().entry(node).or_default();
        self.failures.write().insert(node, failure.clone());
        Ok(())
    }

    fn load_failure(&self, node: NodeId) -> NodeinitResult<Option<StoredFailure>> {
        Ok(self.failures.read().get(&node).cloned())
    }

    fn register(&self, node: NodeId) -> NodeinitResult<()> {
        self.nodes.write().entry(node).or_default();
        Ok(())
    }

    fn list_nodes(&self) -> NodeinitResult<Vec<NodeId>> {
        let nodes: BTreeSet<NodeId> = self.nodes.read().keys().copied().collect();
        Ok(nodes.into_iter().collect())
    }
}
