//! Per-node session state.
//!
//! A `NodeSession` is owned by the scheduler and only mutated under that
//! node's lock. Executors get a shared borrow for the duration of one stage.

mod state;
pub mod transition;

pub use state::NodeMode;
pub use transition::Transition;

use crate::catalog::{Stage, StageCatalog, StaticData};
use crate::executor::FailureReason;
use chrono::{DateTime, Utc};
use nodeinit_shared::NodeId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;

/// Why and where a node failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub stage: Stage,
    pub reason: FailureReason,
}

#[derive(Debug, Clone)]
pub struct NodeSession {
    node_id: NodeId,
    mode: NodeMode,
    current_stage: Stage,
    /// Consecutive failures of `current_stage`.
    attempt: u32,
    static_data: StaticData,
    /// Latest results of dynamic stages. Never persisted.
    dynamic_data: BTreeMap<Stage, Vec<u8>>,
    last_advanced_at: DateTime<Utc>,
    failure: Option<NodeFailure>,
    /// Stages that did not succeed during the current or last heal.
    heal_failures: BTreeSet<Stage>,
    /// Earliest time the current stage may be retried.
    retry_at: Option<Instant>,
}

impl NodeSession {
    /// Fresh session for a newly included node.
    pub fn new(node_id: NodeId, catalog: &StageCatalog) -> Self {
        Self::starting_at(node_id, catalog.initial(), StaticData::new())
    }

    /// Session rebuilt from persisted static data after a restart.
    ///
    /// Starts at the first stage that is dynamic or has no stored result.
    pub fn rehydrate(node_id: NodeId, catalog: &StageCatalog, static_data: StaticData) -> Self {
        let static_data: StaticData = static_data
            .into_iter()
            .filter(|(stage, _)| catalog.spec(*stage).is_some_and(|spec| spec.is_persisted()))
            .collect();
        let resume = catalog.resume_stage(&static_data);
        Self::starting_at(node_id, resume, static_data)
    }

    /// Put a rehydrated session back into `Failed` at `stage`.
    pub(crate) fn restore_failure(&mut self, catalog: &StageCatalog, stage: Stage, reason: String) {
        self.current_stage = if catalog.spec(stage).is_some() {
            stage
        } else {
            catalog.initial()
        };
        self.mark_failed(FailureReason::Recorded(reason));
    }

    fn starting_at(node_id: NodeId, stage: Stage, static_data: StaticData) -> Self {
        Self {
            node_id,
            mode: NodeMode::Initializing,
            current_stage: stage,
            attempt: 0,
            static_data,
            dynamic_data: BTreeMap::new(),
            last_advanced_at: Utc::now(),
            failure: None,
            heal_failures: BTreeSet::new(),
            retry_at: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn static_data(&self) -> &StaticData {
        &self.static_data
    }

    pub fn static_result(&self, stage: Stage) -> Option<&[u8]> {
        self.static_data.get(&stage).map(Vec::as_slice)
    }

    pub fn last_advanced_at(&self) -> DateTime<Utc> {
        self.last_advanced_at
    }

    pub fn failure(&self) -> Option<&NodeFailure> {
        self.failure.as_ref()
    }

    pub fn heal_failures(&self) -> &BTreeSet<Stage> {
        &self.heal_failures
    }

    pub(crate) fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub(crate) fn clear_retry(&mut self) {
        self.retry_at = None;
    }

    /// Move to `stage`, resetting the attempt counter.
    pub(crate) fn advance_to(&mut self, stage: Stage) {
        self.current_stage = stage;
        self.attempt = 0;
        self.retry_at = None;
        self.last_advanced_at = Utc::now();
    }

    pub(crate) fn schedule_retry(&mut self, attempt: u32, at: Instant) {
        self.attempt = attempt;
        self.retry_at = Some(at);
    }

    pub(crate) fn insert_static(&mut self, stage: Stage, data: Vec<u8>) {
        self.static_data.insert(stage, data);
    }

    pub(crate) fn insert_dynamic(&mut self, stage: Stage, data: Vec<u8>) {
        self.dynamic_data.insert(stage, data);
    }

    pub(crate) fn record_heal_failure(&mut self, stage: Stage) {
        self.heal_failures.insert(stage);
    }

    pub(crate) fn begin_heal(&mut self, first: Stage) {
        self.mode = NodeMode::Healing;
        self.heal_failures.clear();
        self.advance_to(first);
    }

    pub(crate) fn mark_ready(&mut self) {
        self.mode = NodeMode::Ready;
        self.retry_at = None;
        self.last_advanced_at = Utc::now();
    }

    pub(crate) fn mark_failed(&mut self, reason: FailureReason) {
        self.mode = NodeMode::Failed;
        self.retry_at = None;
        self.failure = Some(NodeFailure {
            stage: self.current_stage,
            reason,
        });
        self.last_advanced_at = Utc::now();
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.node_id,
            mode: self.mode,
            stage: self.current_stage,
            attempt: self.attempt,
            static_stages: self.static_data.keys().copied().collect(),
            dynamic_data: self.dynamic_data.clone(),
            last_advanced_at: self.last_advanced_at,
            failure: self.failure.as_ref().map(|f| f.reason.to_string()),
            heal_failures: self.heal_failures.iter().copied().collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_mode_for_test(&mut self, mode: NodeMode) {
        self.mode = mode;
    }
}

/// Point-in-time view of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub mode: NodeMode,
    pub stage: Stage,
    pub attempt: u32,
    pub static_stages: Vec<Stage>,
    /// Latest result of every dynamic stage that returned data, refreshed
    /// by each heal.
    pub dynamic_data: BTreeMap<Stage, Vec<u8>>,
    pub last_advanced_at: DateTime<Utc>,
    pub failure: Option<String>,
    pub heal_failures: Vec<Stage>,
}
