//! Health/heal coordinator.
//!
//! Decides *when* ready nodes re-run the heal subset of the catalog. The
//! walk itself is ordinary scheduling: the scheduler switches the session
//! to `Healing` and drives it back to `Ready`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nodeinit_shared::{NodeId, NodeinitError, NodeinitResult};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::runtime::options::HealOptions;
use crate::scheduler::SessionScheduler;
use crate::session::NodeMode;

struct Periodic {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HealCoordinator {
    scheduler: Arc<SessionScheduler>,
    options: HealOptions,
    periodic: Mutex<Option<Periodic>>,
}

impl HealCoordinator {
    pub fn new(scheduler: Arc<SessionScheduler>, options: HealOptions) -> Self {
        Self {
            scheduler,
            options,
            periodic: Mutex::new(None),
        }
    }

    /// Heal one node. Refused with `InvalidState` unless it is `Ready`.
    pub async fn schedule_heal(&self, node_id: NodeId) -> NodeinitResult<()> {
        self.scheduler.begin_heal(node_id).await
    }

    /// Heal every ready node. Returns the nodes a heal was started for.
    pub async fn heal_all(&self) -> Vec<NodeId> {
        let node_ids = self.scheduler.node_ids();
        let attempts = node_ids.iter().map(|&node_id| async move {
            match self.schedule_heal(node_id).await {
                Ok(()) => Some(node_id),
                Err(NodeinitError::InvalidState(reason)) => {
                    tracing::debug!(node_id = %node_id, reason = %reason, "Heal skipped");
                    None
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Heal not started");
                    None
                }
            }
        });

        let started: Vec<NodeId> = join_all(attempts).await.into_iter().flatten().collect();
        tracing::info!(
            nodes = node_ids.len(),
            started = started.len(),
            "Network heal scheduled"
        );
        started
    }

    /// Heal a node that stopped answering. No-op unless it is `Ready`.
    ///
    /// Returns whether a heal was started.
    pub async fn report_unresponsive(&self, node_id: NodeId) -> NodeinitResult<bool> {
        let mode = self.scheduler.snapshot(node_id)?.mode;
        if mode != NodeMode::Ready {
            tracing::debug!(node_id = %node_id, mode = %mode, "Unresponsive node not ready, ignoring");
            return Ok(false);
        }

        tracing::info!(node_id = %node_id, "Node unresponsive, healing");
        match self.schedule_heal(node_id).await {
            Ok(()) => Ok(true),
            // Lost a race with another heal or a failure.
            Err(NodeinitError::InvalidState(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run `heal_all` every interval (± jitter) until stopped.
    pub fn start_periodic(self: &Arc<Self>) -> NodeinitResult<()> {
        if self.options.interval().is_zero() {
            return Err(NodeinitError::Config(
                "periodic heal needs a non-zero interval".into(),
            ));
        }

        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let delay = coordinator.next_delay();
                tracing::debug!(delay_secs = delay.as_secs(), "Next network heal scheduled");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                coordinator.heal_all().await;
            }
            tracing::debug!("Periodic heal stopped");
        });

        *periodic = Some(Periodic { cancel, task });
        tracing::info!(
            interval_secs = self.options.interval_secs,
            "Periodic heal started"
        );
        Ok(())
    }

    pub async fn stop_periodic(&self) {
        let periodic = self.periodic.lock().take();
        if let Some(periodic) = periodic {
            periodic.cancel.cancel();
            let _ = periodic.task.await;
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.periodic.lock().is_some()
    }

    fn next_delay(&self) -> Duration {
        let interval = self.options.interval();
        let jitter = self.options.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 {
            return interval;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        interval.mul_f64(factor)
    }
}
