//! Session scheduler.
//!
//! Owns every [`NodeSession`] and is the only code that mutates one.
//!
//! **Concurrency model**:
//! - One slot per node, holding the session behind a `tokio::sync::Mutex`.
//!   `advance` holds that lock for the whole stage, so a node never has two
//!   requests in flight. A backoff wait gives the lock up as soon as another
//!   caller (`force_fail`) rings the slot's `Notify`.
//! - A global `Semaphore` caps how many nodes have a stage in flight.
//! - Each node is driven by at most one spawned task looping on `advance`.
//! - Cancellation is cooperative: every await point (lock, backoff, permit,
//!   transport) races the slot's `CancellationToken`.

mod backoff;

pub use backoff::RetryPolicy;

use std::collections::HashMap;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use nodeinit_shared::{NodeId, NodeinitError, NodeinitResult};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Stage, StageCatalog, StageSpec};
use crate::events::{EventSink, NodeEvent};
use crate::executor::{ExecutionResult, FailureReason, StageExecutor};
use crate::metrics::{SchedulerMetrics, SchedulerMetricsStorage};
use crate::runtime::options::SchedulerOptions;
use crate::session::transition::{self, Transition};
use crate::session::{NodeMode, NodeSession, NodeSnapshot};
use crate::store::{StaticDataStore, StoredFailure};
use crate::transport::NodeTransport;

/// Outcome of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Moved to another stage; call again.
    Continue,
    /// The stage will be retried after `delay`; call again.
    Retrying { delay: Duration },
    /// Nothing left to run in this mode.
    Settled(NodeMode),
    /// The node was excluded or the scheduler shut down.
    Cancelled,
}

struct NodeSlot {
    session: tokio::sync::Mutex<NodeSession>,
    cancel: CancellationToken,
    /// Latest snapshot, published after every change.
    state: watch::Sender<NodeSnapshot>,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Cuts a backoff wait short so a waiting caller can take the session.
    wake: Notify,
}

impl NodeSlot {
    fn publish(&self, session: &NodeSession) {
        self.state.send_replace(session.snapshot());
    }
}

pub struct SessionScheduler {
    catalog: Arc<StageCatalog>,
    executor: StageExecutor,
    store: Arc<dyn StaticDataStore>,
    events: Arc<dyn EventSink>,
    options: SchedulerOptions,
    in_flight: Semaphore,
    slots: Mutex<HashMap<NodeId, Arc<NodeSlot>>>,
    metrics: SchedulerMetricsStorage,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SessionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionScheduler")
            .field("nodes", &self.slots.lock().len())
            .finish()
    }
}

impl SessionScheduler {
    pub fn new(
        catalog: Arc<StageCatalog>,
        transport: Arc<dyn NodeTransport>,
        store: Arc<dyn StaticDataStore>,
        events: Arc<dyn EventSink>,
        options: SchedulerOptions,
    ) -> Self {
        let executor = StageExecutor::new(transport, options.timeouts, options.controller_id);
        let permits = options.max_in_flight.max(1);
        Self {
            catalog,
            executor,
            store,
            events,
            options,
            in_flight: Semaphore::new(permits),
            slots: Mutex::new(HashMap::new()),
            metrics: SchedulerMetricsStorage::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<StageCatalog> {
        &self.catalog
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics::new(self.metrics.clone())
    }

    fn slot(&self, node_id: NodeId) -> NodeinitResult<Arc<NodeSlot>> {
        self.slots
            .lock()
            .get(&node_id)
            .cloned()
            .ok_or_else(|| NodeinitError::NotFound(format!("node {}", node_id)))
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Hand a session to the scheduler without starting it.
    pub fn attach(&self, session: NodeSession) -> NodeinitResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(NodeinitError::Cancelled("scheduler is shut down".into()));
        }

        let node_id = session.node_id();
        let mode = session.mode();
        let mut slots = self.slots.lock();
        if slots.contains_key(&node_id) {
            return Err(NodeinitError::InvalidState(format!(
                "node {} already has a session",
                node_id
            )));
        }

        let (state, _) = watch::channel(session.snapshot());
        tracing::debug!(
            node_id = %node_id,
            stage = %session.current_stage(),
            mode = %mode,
            "Attaching session"
        );
        slots.insert(
            node_id,
            Arc::new(NodeSlot {
                session: tokio::sync::Mutex::new(session),
                cancel: self.shutdown.child_token(),
                state,
                driver: Mutex::new(None),
                wake: Notify::new(),
            }),
        );
        drop(slots);

        self.events.mode_changed(node_id, mode);
        Ok(())
    }

    /// Start initializing a newly joined node from the first stage.
    pub fn include(self: &Arc<Self>, node_id: NodeId) -> NodeinitResult<()> {
        if let Err(e) = self.store.register(node_id) {
            SchedulerMetricsStorage::bump(&self.metrics.persistence_failures);
            tracing::warn!(node_id = %node_id, error = %e, "Failed to register node");
        }
        self.attach(NodeSession::new(node_id, &self.catalog))?;
        tracing::info!(node_id = %node_id, "Node included");
        self.spawn(node_id)
    }

    /// Continue initializing a known node from its persisted static data.
    ///
    /// Returns the stage the session resumes at. A node with a recorded
    /// failure comes back `Failed` at its failed stage and is not driven.
    pub fn resume(self: &Arc<Self>, node_id: NodeId) -> NodeinitResult<Stage> {
        let static_data = self.store.load(node_id)?;
        let failure = self.store.load_failure(node_id)?;

        let mut session = NodeSession::rehydrate(node_id, &self.catalog, static_data);
        if let Some(failure) = failure {
            session.restore_failure(&self.catalog, failure.stage, failure.reason);
        }
        let stage = session.current_stage();
        let mode = session.mode();
        self.attach(session)?;

        if mode == NodeMode::Failed {
            tracing::info!(node_id = %node_id, stage = %stage, "Node resumed as failed");
            return Ok(stage);
        }
        tracing::info!(node_id = %node_id, stage = %stage, "Node resumed");
        self.spawn(node_id)?;
        Ok(stage)
    }

    /// Start a driver task for the node unless one is already running.
    pub fn spawn(self: &Arc<Self>, node_id: NodeId) -> NodeinitResult<()> {
        let slot = self.slot(node_id)?;
        let mut driver = slot.driver.lock();
        if driver.is_some() {
            return Ok(());
        }

        let scheduler = Arc::clone(self);
        let task_slot = Arc::clone(&slot);
        *driver = Some(tokio::spawn(async move {
            scheduler.drive(node_id, task_slot).await
        }));
        Ok(())
    }

    async fn drive(&self, node_id: NodeId, slot: Arc<NodeSlot>) {
        loop {
            match self.run(node_id).await {
                Ok(mode) => {
                    // A heal that began after `run` returned saw this driver
                    // in `spawn` and is ours to drive.
                    let mut driver = slot.driver.lock();
                    if slot.state.borrow().mode.is_active() {
                        continue;
                    }
                    *driver = None;
                    tracing::debug!(node_id = %node_id, mode = %mode, "Driver finished");
                    return;
                }
                Err(NodeinitError::Cancelled(_)) | Err(NodeinitError::NotFound(_)) => {
                    tracing::debug!(node_id = %node_id, "Driver cancelled");
                    return;
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Driver stopped");
                    slot.driver.lock().take();
                    return;
                }
            }
        }
    }

    /// Drive the node until it settles.
    pub async fn run(&self, node_id: NodeId) -> NodeinitResult<NodeMode> {
        loop {
            match self.advance(node_id).await? {
                Step::Continue | Step::Retrying { .. } => continue,
                Step::Settled(mode) => return Ok(mode),
                Step::Cancelled => {
                    return Err(NodeinitError::Cancelled(format!("node {}", node_id)));
                }
            }
        }
    }

    /// Remove a node: cancel its work, forget its session and clear its
    /// persisted data.
    pub async fn exclude(&self, node_id: NodeId) -> NodeinitResult<()> {
        let slot = self
            .slots
            .lock()
            .remove(&node_id)
            .ok_or_else(|| NodeinitError::NotFound(format!("node {}", node_id)))?;

        slot.cancel.cancel();
        let driver = slot.driver.lock().take();
        if let Some(handle) = driver {
            let _ = handle.await;
        }

        self.store.clear(node_id)?;
        tracing::info!(node_id = %node_id, "Node excluded");
        Ok(())
    }

    /// Start over from the first stage, discarding everything known about
    /// the node. The only way out of `Failed`.
    pub async fn reinclude(self: &Arc<Self>, node_id: NodeId) -> NodeinitResult<()> {
        match self.exclude(node_id).await {
            Ok(()) | Err(NodeinitError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.include(node_id)
    }

    /// Fail a node on operator request.
    ///
    /// Waits at most for a stage in flight; a pending backoff is cut short.
    pub async fn force_fail(&self, node_id: NodeId, reason: &str) -> NodeinitResult<()> {
        let slot = self.slot(node_id)?;

        // Queue for the lock before waking a backoff wait, so the wait hands
        // the session to us and not to the driver's next call.
        let lock = slot.session.lock();
        tokio::pin!(lock);
        let mut session = match futures::poll!(lock.as_mut()) {
            Poll::Ready(session) => session,
            Poll::Pending => {
                slot.wake.notify_one();
                lock.await
            }
        };
        if !session.mode().can_transition_to(NodeMode::Failed) {
            return Err(NodeinitError::InvalidState(format!(
                "node {} is {}",
                node_id,
                session.mode()
            )));
        }

        self.fail(&slot, &mut session, FailureReason::Forced(reason.to_string()));
        Ok(())
    }

    /// Switch a ready node to `Healing` at the first heal stage and drive it.
    pub async fn begin_heal(self: &Arc<Self>, node_id: NodeId) -> NodeinitResult<()> {
        let slot = self.slot(node_id)?;
        {
            let mut session = slot.session.lock().await;
            if !session.mode().can_heal() {
                return Err(NodeinitError::InvalidState(format!(
                    "node {} is {}, only ready nodes can heal",
                    node_id,
                    session.mode()
                )));
            }

            let from = session.current_stage();
            let to = self.catalog.first_heal_stage();
            session.begin_heal(to);
            tracing::info!(node_id = %node_id, stage = %to, "Heal started");

            self.events.mode_changed(node_id, NodeMode::Healing);
            self.events
                .publish(NodeEvent::NodeStageAdvanced { node_id, from, to });
            slot.publish(&session);
        }
        self.spawn(node_id)
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Latest published state. Never waits for a stage in flight.
    pub fn snapshot(&self, node_id: NodeId) -> NodeinitResult<NodeSnapshot> {
        Ok(self.slot(node_id)?.state.borrow().clone())
    }

    /// Follow a node's state. The channel closes when the node is excluded.
    pub fn watch(&self, node_id: NodeId) -> NodeinitResult<watch::Receiver<NodeSnapshot>> {
        Ok(self.slot(node_id)?.state.subscribe())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.slots.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Cancel every driver and wait for them. Persisted data is kept.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.in_flight.close();

        let slots: Vec<Arc<NodeSlot>> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let count = slots.len();
        for slot in slots {
            let driver = slot.driver.lock().take();
            if let Some(handle) = driver {
                let _ = handle.await;
            }
        }
        tracing::info!(nodes = count, "Scheduler shut down");
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    /// Execute the node's current stage once and apply the result.
    pub async fn advance(&self, node_id: NodeId) -> NodeinitResult<Step> {
        let slot = self.slot(node_id)?;
        let cancel = &slot.cancel;

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Step::Cancelled),
            session = slot.session.lock() => session,
        };

        if !session.mode().is_active() {
            return Ok(Step::Settled(session.mode()));
        }

        if let Some(at) = session.retry_at() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Step::Cancelled),
                // Release the session; the next call sleeps out the rest.
                _ = slot.wake.notified() => {
                    return Ok(Step::Retrying {
                        delay: at.saturating_duration_since(Instant::now()),
                    });
                }
                _ = tokio::time::sleep_until(at) => {}
            }
            session.clear_retry();
        }

        let stage = session.current_stage();
        let spec = *self.catalog.spec(stage).ok_or_else(|| {
            NodeinitError::Internal(format!("stage {} is not in the catalog", stage))
        })?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Step::Cancelled),
            permit = self.in_flight.acquire() => permit
                .map_err(|_| NodeinitError::Cancelled("scheduler is shut down".into()))?,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(node_id = %node_id, stage = %stage, "Stage cancelled in flight");
                return Ok(Step::Cancelled);
            }
            result = self.executor.execute(&session, &spec) => result,
        };
        drop(permit);
        SchedulerMetricsStorage::bump(&self.metrics.stages_executed);

        let transition = transition::plan(
            &self.catalog,
            &session,
            &spec,
            &result,
            self.options.max_attempts,
        );
        self.capture(&mut session, &spec, result);
        let step = self.apply(&slot, &mut session, transition);
        slot.publish(&session);
        Ok(step)
    }

    /// File a successful stage's data under its own key.
    fn capture(&self, session: &mut NodeSession, spec: &StageSpec, result: ExecutionResult) {
        let ExecutionResult::Success(captured) = result else {
            return;
        };
        let node_id = session.node_id();

        if spec.is_persisted() && session.mode() == NodeMode::Initializing {
            let data = captured.unwrap_or_default();
            if let Err(e) = self.store.save(node_id, spec.stage, &data) {
                SchedulerMetricsStorage::bump(&self.metrics.persistence_failures);
                let reason = FailureReason::PersistenceWriteFailure(e.to_string());
                tracing::warn!(
                    node_id = %node_id,
                    stage = %spec.stage,
                    error = %reason,
                    "Static data not persisted, continuing"
                );
            }
            session.insert_static(spec.stage, data);
        } else if let Some(data) = captured {
            session.insert_dynamic(spec.stage, data);
        }
    }

    fn apply(&self, slot: &NodeSlot, session: &mut NodeSession, transition: Transition) -> Step {
        let node_id = session.node_id();
        let from = session.current_stage();

        match transition {
            Transition::Advance { to, skipped } => {
                if let Some(reason) = skipped {
                    self.skip(session, &reason);
                }
                session.advance_to(to);
                self.events
                    .publish(NodeEvent::NodeStageAdvanced { node_id, from, to });
                Step::Continue
            }
            Transition::Retry { attempt } => {
                let delay = self.options.retry.delay(attempt);
                session.schedule_retry(attempt, Instant::now() + delay);
                SchedulerMetricsStorage::bump(&self.metrics.retries);
                tracing::debug!(
                    node_id = %node_id,
                    stage = %from,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Stage will be retried"
                );
                Step::Retrying { delay }
            }
            Transition::Complete { skipped } => {
                if let Some(reason) = skipped {
                    self.skip(session, &reason);
                }
                self.complete(session);
                Step::Settled(NodeMode::Ready)
            }
            Transition::Fail(reason) => {
                self.fail(slot, session, reason);
                Step::Settled(NodeMode::Failed)
            }
        }
    }

    fn skip(&self, session: &mut NodeSession, reason: &FailureReason) {
        let stage = session.current_stage();
        SchedulerMetricsStorage::bump(&self.metrics.stages_skipped);
        if session.mode() == NodeMode::Healing {
            SchedulerMetricsStorage::bump(&self.metrics.heal_stage_failures);
            session.record_heal_failure(stage);
        }
        tracing::warn!(
            node_id = %session.node_id(),
            stage = %stage,
            mode = %session.mode(),
            reason = %reason,
            "Skipping stage"
        );
    }

    fn complete(&self, session: &mut NodeSession) {
        let node_id = session.node_id();
        let healing = session.mode() == NodeMode::Healing;
        session.mark_ready();

        if healing {
            let failed_stages: Vec<Stage> = session.heal_failures().iter().copied().collect();
            SchedulerMetricsStorage::bump(&self.metrics.heals_completed);
            tracing::info!(
                node_id = %node_id,
                failed = failed_stages.len(),
                "Heal completed"
            );
            self.events.publish(NodeEvent::NodeHealCompleted {
                node_id,
                failed_stages,
            });
        } else {
            SchedulerMetricsStorage::bump(&self.metrics.nodes_ready);
            tracing::info!(
                node_id = %node_id,
                static_stages = session.static_data().len(),
                "Node ready"
            );
            self.events.publish(NodeEvent::NodeReady { node_id });
        }
    }

    fn fail(&self, slot: &NodeSlot, session: &mut NodeSession, reason: FailureReason) {
        let node_id = session.node_id();
        let stage = session.current_stage();
        session.mark_failed(reason.clone());
        SchedulerMetricsStorage::bump(&self.metrics.nodes_failed);

        let stored = StoredFailure {
            stage,
            reason: reason.to_string(),
        };
        if let Err(e) = self.store.mark_failed(node_id, &stored) {
            SchedulerMetricsStorage::bump(&self.metrics.persistence_failures);
            tracing::warn!(node_id = %node_id, error = %e, "Failure not persisted");
        }

        tracing::error!(node_id = %node_id, stage = %stage, reason = %reason, "Node failed");
        self.events.publish(NodeEvent::NodeFailed {
            node_id,
            stage,
            reason,
        });
        slot.publish(session);
    }
}
