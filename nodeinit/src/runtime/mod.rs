//! Administrative surface.
//!
//! `NodeRuntime` wires catalog, transport, store, scheduler, heal
//! coordinator and registry together and exposes the operations an
//! operator or host application needs.

pub mod options;

use std::sync::Arc;

use futures::future::join_all;
use nodeinit_shared::{NodeId, NodeinitError, NodeinitResult};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::catalog::{Stage, StageCatalog};
use crate::db::Database;
use crate::events::{EventSink, FanoutSink, NodeEvent};
use crate::heal::HealCoordinator;
use crate::init_logging_for;
use crate::metrics::SchedulerMetrics;
use crate::registry::{NodeRecord, NodeRegistry};
use crate::scheduler::SessionScheduler;
use crate::session::{NodeMode, NodeSnapshot};
use crate::store::{MemoryStaticStore, SqliteStaticStore, StaticDataStore};
use crate::transport::NodeTransport;
use options::RuntimeOptions;

/// Everything known about one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Live session state.
    pub session: NodeSnapshot,
    /// History folded from events.
    pub record: Option<NodeRecord>,
}

/// Main entry point.
///
/// **Cloning**: cheap, all clones share the same state.
#[derive(Clone)]
pub struct NodeRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    scheduler: Arc<SessionScheduler>,
    heal: Arc<HealCoordinator>,
    registry: NodeRegistry,
    store: Arc<dyn StaticDataStore>,
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

/// Optional pieces for [`NodeRuntime::with_parts`].
#[derive(Default)]
pub struct RuntimeParts {
    /// Defaults to [`StageCatalog::standard`].
    pub catalog: Option<StageCatalog>,
    /// Defaults to SQLite under `home_dir`, or memory when ephemeral.
    pub store: Option<Arc<dyn StaticDataStore>>,
    /// Receives every event after the registry.
    pub sink: Option<Arc<dyn EventSink>>,
}

impl NodeRuntime {
    /// Create a runtime with the standard catalog.
    ///
    /// Must be called inside a tokio runtime when periodic heals are on.
    pub fn new(options: RuntimeOptions, transport: Arc<dyn NodeTransport>) -> NodeinitResult<Self> {
        Self::with_parts(options, transport, RuntimeParts::default())
    }

    pub fn with_parts(
        options: RuntimeOptions,
        transport: Arc<dyn NodeTransport>,
        parts: RuntimeParts,
    ) -> NodeinitResult<Self> {
        let options = options.sanitize()?;
        if !options.ephemeral {
            init_logging_for(&options.home_dir)?;
        }

        let store: Arc<dyn StaticDataStore> = match parts.store {
            Some(store) => store,
            None if options.ephemeral => Arc::new(MemoryStaticStore::new()),
            None => {
                let db = Database::open(&options.db_path())?;
                Arc::new(SqliteStaticStore::new(db))
            }
        };

        let registry = NodeRegistry::new();
        let events: Arc<dyn EventSink> = match parts.sink {
            Some(sink) => Arc::new(FanoutSink::new(vec![Arc::new(registry.clone()), sink])),
            None => Arc::new(registry.clone()),
        };

        let catalog = Arc::new(parts.catalog.unwrap_or_else(StageCatalog::standard));
        let scheduler = Arc::new(SessionScheduler::new(
            catalog,
            transport,
            Arc::clone(&store),
            events,
            options.scheduler.clone(),
        ));
        let heal = Arc::new(HealCoordinator::new(
            Arc::clone(&scheduler),
            options.heal.clone(),
        ));

        if options.heal.periodic {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(NodeinitError::Config(
                    "periodic heals need a tokio runtime".into(),
                ));
            }
            heal.start_periodic()?;
        }

        tracing::info!(
            home_dir = %options.home_dir.display(),
            ephemeral = options.ephemeral,
            max_in_flight = options.scheduler.max_in_flight,
            "Node runtime started"
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                scheduler,
                heal,
                registry,
                store,
            }),
        })
    }

    // ========================================================================
    // Node lifecycle
    // ========================================================================

    /// Start initializing a node that just joined the network.
    pub fn include_node(&self, node_id: NodeId) -> NodeinitResult<()> {
        self.inner.scheduler.include(node_id)
    }

    /// Stop all work on a node and forget it, including persisted data.
    pub async fn exclude_node(&self, node_id: NodeId) -> NodeinitResult<()> {
        self.inner.scheduler.exclude(node_id).await?;
        self.inner.registry.remove(node_id)?;
        Ok(())
    }

    /// Re-run the heal stages of a ready node.
    pub async fn heal_node(&self, node_id: NodeId) -> NodeinitResult<()> {
        self.inner.heal.schedule_heal(node_id).await
    }

    /// Heal every ready node now.
    pub async fn heal_network(&self) -> Vec<NodeId> {
        self.inner.heal.heal_all().await
    }

    pub async fn report_unresponsive(&self, node_id: NodeId) -> NodeinitResult<bool> {
        self.inner.heal.report_unresponsive(node_id).await
    }

    /// Mark a node failed on operator request.
    pub async fn fail_node(&self, node_id: NodeId, reason: &str) -> NodeinitResult<()> {
        self.inner.scheduler.force_fail(node_id, reason).await
    }

    /// Throw away everything known about a node and initialize it again.
    pub async fn reinclude_node(&self, node_id: NodeId) -> NodeinitResult<()> {
        self.inner.scheduler.reinclude(node_id).await
    }

    /// Resume every node in the store that has no session yet.
    ///
    /// Returns each resumed node with the stage it resumed at. Nodes that
    /// cannot be resumed are logged and skipped.
    pub fn recover_nodes(&self) -> NodeinitResult<Vec<(NodeId, Stage)>> {
        let attached = self.inner.scheduler.node_ids();
        let mut resumed = Vec::new();

        for node_id in self.inner.store.list_nodes()? {
            if attached.contains(&node_id) {
                continue;
            }
            match self.inner.scheduler.resume(node_id) {
                Ok(stage) => resumed.push((node_id, stage)),
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Failed to recover node");
                }
            }
        }

        tracing::info!(count = resumed.len(), "Recovered nodes");
        Ok(resumed)
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn info(&self, node_id: NodeId) -> NodeinitResult<NodeInfo> {
        Ok(NodeInfo {
            session: self.inner.scheduler.snapshot(node_id)?,
            record: self.inner.registry.get(node_id)?,
        })
    }

    /// Snapshots of every node, ordered by id.
    pub fn list(&self) -> Vec<NodeSnapshot> {
        self.inner
            .scheduler
            .node_ids()
            .into_iter()
            .filter_map(|node_id| self.inner.scheduler.snapshot(node_id).ok())
            .collect()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner.scheduler.metrics()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.registry.subscribe()
    }

    /// Wait until the node is `Ready` or `Failed`.
    pub async fn wait_settled(&self, node_id: NodeId) -> NodeinitResult<NodeMode> {
        let mut rx = self.inner.scheduler.watch(node_id)?;
        let snapshot = rx
            .wait_for(|snapshot| snapshot.mode.is_settled())
            .await
            .map_err(|_| NodeinitError::Cancelled(format!("node {} was removed", node_id)))?;
        Ok(snapshot.mode)
    }

    /// Wait for every node with a session to settle.
    pub async fn wait_all_settled(&self) -> Vec<(NodeId, NodeinitResult<NodeMode>)> {
        let node_ids = self.inner.scheduler.node_ids();
        let waits = node_ids.iter().map(|&node_id| async move {
            (node_id, self.wait_settled(node_id).await)
        });
        join_all(waits).await
    }

    /// Stop periodic heals and every driver. Persisted data is kept so the
    /// next runtime can `recover_nodes`.
    pub async fn shutdown(&self) {
        self.inner.heal.stop_periodic().await;
        self.inner.scheduler.shutdown().await;
    }
}
