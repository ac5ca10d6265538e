//! Scheduler-wide metrics (aggregate across all nodes).

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage for scheduler counters.
///
/// Shared by the scheduler and the heal coordinator. All counters are
/// monotonic.
#[derive(Clone, Default)]
pub struct SchedulerMetricsStorage {
    /// Stage executions, including retries
    pub(crate) stages_executed: Arc<AtomicU64>,
    /// Executions that ended in a scheduled retry
    pub(crate) retries: Arc<AtomicU64>,
    /// Optional or heal stages given up and skipped
    pub(crate) stages_skipped: Arc<AtomicU64>,
    pub(crate) nodes_ready: Arc<AtomicU64>,
    pub(crate) nodes_failed: Arc<AtomicU64>,
    pub(crate) heals_completed: Arc<AtomicU64>,
    /// Stages that did not succeed during a heal
    pub(crate) heal_stage_failures: Arc<AtomicU64>,
    /// Static data writes the store refused
    pub(crate) persistence_failures: Arc<AtomicU64>,
}

impl SchedulerMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle for querying scheduler metrics.
///
/// Cloneable, lightweight handle (only Arc pointers).
#[derive(Clone)]
pub struct SchedulerMetrics {
    storage: SchedulerMetricsStorage,
}

impl SchedulerMetrics {
    pub(crate) fn new(storage: SchedulerMetricsStorage) -> Self {
        Self { storage }
    }

    /// Stage executions since startup, retries included.
    pub fn stages_executed_total(&self) -> u64 {
        self.storage.stages_executed.load(Ordering::Relaxed)
    }

    pub fn retries_total(&self) -> u64 {
        self.storage.retries.load(Ordering::Relaxed)
    }

    /// Stages abandoned without failing the node.
    pub fn stages_skipped_total(&self) -> u64 {
        self.storage.stages_skipped.load(Ordering::Relaxed)
    }

    /// Inclusions that reached `Ready`. Heals are not counted.
    pub fn nodes_ready_total(&self) -> u64 {
        self.storage.nodes_ready.load(Ordering::Relaxed)
    }

    pub fn nodes_failed_total(&self) -> u64 {
        self.storage.nodes_failed.load(Ordering::Relaxed)
    }

    pub fn heals_completed_total(&self) -> u64 {
        self.storage.heals_completed.load(Ordering::Relaxed)
    }

    pub fn heal_stage_failures_total(&self) -> u64 {
        self.storage.heal_stage_failures.load(Ordering::Relaxed)
    }

    /// Static data writes that failed. Progression continued regardless.
    pub fn persistence_failures_total(&self) -> u64 {
        self.storage.persistence_failures.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stages_executed: self.stages_executed_total(),
            retries: self.retries_total(),
            stages_skipped: self.stages_skipped_total(),
            nodes_ready: self.nodes_ready_total(),
            nodes_failed: self.nodes_failed_total(),
            heals_completed: self.heals_completed_total(),
            heal_stage_failures: self.heal_stage_failures_total(),
            persistence_failures: self.persistence_failures_total(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub stages_executed: u64,
    pub retries: u64,
    pub stages_skipped: u64,
    pub nodes_ready: u64,
    pub nodes_failed: u64,
    pub heals_completed: u64,
    pub heal_stage_failures: u64,
    pub persistence_failures: u64,
}
