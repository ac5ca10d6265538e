//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nodeinit::catalog::{Reach, Stage, StageCatalog, StageFlags, StageSpec};
use nodeinit::events::{EventSink, NodeEvent};
use nodeinit::scheduler::{RetryPolicy, SessionScheduler};
use nodeinit::store::{StaticDataStore, StoredFailure};
use nodeinit::transport::NodeTransport;
use nodeinit::{NodeMode, SchedulerOptions, StageTimeouts, StaticData};
use nodeinit_shared::frame::command_class;
use nodeinit_shared::{
    FunctionId, NodeId, NodeinitError, NodeinitResult, RequestFrame, ResponseFrame,
    TransportError,
};
use parking_lot::Mutex;

pub const CONTROLLER: NodeId = NodeId::new(1);
pub const MANUFACTURER: [u8; 6] = [0x00, 0x86, 0x00, 0x03, 0x00, 0x60];

// ============================================================================
// Scripted transport
// ============================================================================

/// Transport answering from a fixed device model, with per-function
/// scripted faults.
pub struct ScriptedTransport {
    classes: Vec<u8>,
    /// Popped once per call; `None` answers normally.
    script: Mutex<HashMap<FunctionId, VecDeque<Option<TransportError>>>>,
    always: Mutex<HashMap<FunctionId, TransportError>>,
    hang: Mutex<BTreeSet<FunctionId>>,
    payloads: Mutex<HashMap<FunctionId, Vec<u8>>>,
    delay: Mutex<Duration>,
    calls: Mutex<HashMap<(NodeId, FunctionId), usize>>,
    groups: Mutex<HashMap<NodeId, BTreeSet<u16>>>,
    in_flight: Mutex<HashMap<NodeId, usize>>,
    max_per_node: AtomicUsize,
    total: AtomicUsize,
    max_total: AtomicUsize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::with_classes(vec![
            command_class::BASIC,
            command_class::CONFIGURATION,
            command_class::ASSOCIATION,
            command_class::VERSION,
        ])
    }
}

impl ScriptedTransport {
    pub fn with_classes(classes: Vec<u8>) -> Self {
        Self {
            classes,
            script: Mutex::new(HashMap::new()),
            always: Mutex::new(HashMap::new()),
            hang: Mutex::new(BTreeSet::new()),
            payloads: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_per_node: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            max_total: AtomicUsize::new(0),
        }
    }

    /// Outcomes for the next calls of `function`, in order.
    pub fn script(&self, function: FunctionId, outcomes: Vec<Option<TransportError>>) {
        self.script
            .lock()
            .entry(function)
            .or_default()
            .extend(outcomes);
    }

    /// Fail the next `times` calls of `function` with no response.
    pub fn drop_next(&self, function: FunctionId, times: usize) {
        self.script(
            function,
            vec![Some(TransportError::NoResponse { timeout_ms: 50 }); times],
        );
    }

    pub fn fail_always(&self, function: FunctionId, err: TransportError) {
        self.always.lock().insert(function, err);
    }

    pub fn heal_function(&self, function: FunctionId) {
        self.always.lock().remove(&function);
        self.script.lock().remove(&function);
    }

    pub fn hang_on(&self, function: FunctionId) {
        self.hang.lock().insert(function);
    }

    /// Answer `function` with `payload` from now on.
    pub fn set_payload(&self, function: FunctionId, payload: Vec<u8>) {
        self.payloads.lock().insert(function, payload);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self, node: NodeId, function: FunctionId) -> usize {
        self.calls
            .lock()
            .get(&(node, function))
            .copied()
            .unwrap_or_default()
    }

    pub fn total_calls(&self, function: FunctionId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|((_, f), _)| *f == function)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn in_flight(&self, node: NodeId) -> usize {
        self.in_flight.lock().get(&node).copied().unwrap_or_default()
    }

    /// Highest number of concurrent requests ever seen for a single node.
    pub fn max_in_flight_per_node(&self) -> usize {
        self.max_per_node.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent requests ever seen across nodes.
    pub fn max_in_flight_total(&self) -> usize {
        self.max_total.load(Ordering::SeqCst)
    }

    pub fn lifeline(&self, node: NodeId) -> Vec<u16> {
        self.groups
            .lock()
            .get(&node)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn enter(&self, node: NodeId, function: FunctionId) {
        *self.calls.lock().entry((node, function)).or_default() += 1;

        let per_node = {
            let mut in_flight = self.in_flight.lock();
            let count = in_flight.entry(node).or_default();
            *count += 1;
            *count
        };
        self.max_per_node.fetch_max(per_node, Ordering::SeqCst);
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);
    }

    fn leave(&self, node: NodeId) {
        if let Some(count) = self.in_flight.lock().get_mut(&node) {
            *count = count.saturating_sub(1);
        }
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    fn answer(&self, node: NodeId, request: &RequestFrame) -> ResponseFrame {
        if let Some(payload) = self.payloads.lock().get(&request.function) {
            return ResponseFrame::new(request.function, payload.clone());
        }
        let payload = match request.function {
            FunctionId::NoOperation
            | FunctionId::DeleteReturnRoutes
            | FunctionId::AssignReturnRoute => Vec::new(),
            FunctionId::ProtocolInfo => vec![0xd3, 0x9c, 0x01, 0x04],
            FunctionId::IsFailedNode => vec![0],
            FunctionId::NodeInfo => self.classes.clone(),
            FunctionId::SecurityCommandsGet => vec![command_class::BASIC],
            FunctionId::ManufacturerSpecificGet => MANUFACTURER.to_vec(),
            FunctionId::VersionGet => vec![0x03, 0x01],
            FunctionId::MultiChannelEndpointGet => vec![2],
            FunctionId::AssociationGroupingsGet => vec![1],
            FunctionId::AssociationGet => self
                .lifeline(node)
                .iter()
                .flat_map(|m| m.to_be_bytes())
                .collect(),
            FunctionId::AssociationSet => {
                if let [_, hi, lo, ..] = request.payload.as_slice() {
                    self.groups
                        .lock()
                        .entry(node)
                        .or_default()
                        .insert(u16::from_be_bytes([*hi, *lo]));
                }
                Vec::new()
            }
            FunctionId::ConfigurationGet => vec![0x01, 0x01, 0x00],
            FunctionId::ValuesGet => vec![0xff],
            FunctionId::NeighborUpdate => vec![0x00, 0x01],
        };
        ResponseFrame::new(request.function, payload)
    }
}

struct InFlightGuard<'a> {
    transport: &'a ScriptedTransport,
    node: NodeId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.transport.leave(self.node);
    }
}

#[async_trait]
impl NodeTransport for ScriptedTransport {
    async fn send(
        &self,
        node: NodeId,
        request: RequestFrame,
        _timeout: Duration,
    ) -> Result<ResponseFrame, TransportError> {
        let function = request.function;
        self.enter(node, function);
        let _guard = InFlightGuard {
            transport: self,
            node,
        };

        if self.hang.lock().contains(&function) {
            std::future::pending::<()>().await;
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .script
            .lock()
            .get_mut(&function)
            .and_then(|queue| queue.pop_front());
        if let Some(Some(err)) = scripted {
            return Err(err);
        }
        if let Some(err) = self.always.lock().get(&function).cloned() {
            return Err(err);
        }
        Ok(self.answer(node, &request))
    }
}

// ============================================================================
// Recording sink
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NodeEvent>>,
    modes: Mutex<Vec<(NodeId, NodeMode)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.lock().clone()
    }

    pub fn for_node(&self, node: NodeId) -> Vec<NodeEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.node_id() == node)
            .collect()
    }

    pub fn failed_count(&self, node: NodeId) -> usize {
        self.for_node(node)
            .iter()
            .filter(|event| matches!(event, NodeEvent::NodeFailed { .. }))
            .count()
    }

    /// `(from, to)` of every stage change, in order.
    pub fn advances(&self, node: NodeId) -> Vec<(Stage, Stage)> {
        self.for_node(node)
            .into_iter()
            .filter_map(|event| match event {
                NodeEvent::NodeStageAdvanced { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn modes(&self) -> Vec<(NodeId, NodeMode)> {
        self.modes.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: NodeEvent) {
        self.events.lock().push(event);
    }

    fn mode_changed(&self, node_id: NodeId, mode: NodeMode) {
        self.modes.lock().push((node_id, mode));
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Store whose writes always fail.
#[derive(Default)]
pub struct BrokenStore;

impl StaticDataStore for BrokenStore {
    fn load(&self, _node: NodeId) -> NodeinitResult<StaticData> {
        Ok(StaticData::new())
    }

    fn save(&self, _node: NodeId, _stage: Stage, _data: &[u8]) -> NodeinitResult<()> {
        Err(NodeinitError::Database("disk full".into()))
    }

    fn clear(&self, _node: NodeId) -> NodeinitResult<()> {
        Ok(())
    }

    fn mark_failed(&self, _node: NodeId, _failure: &StoredFailure) -> NodeinitResult<()> {
        Err(NodeinitError::Database("disk full".into()))
    }

    fn load_failure(&self, _node: NodeId) -> NodeinitResult<Option<StoredFailure>> {
        Ok(None)
    }

    fn register(&self, _node: NodeId) -> NodeinitResult<()> {
        Err(NodeinitError::Database("disk full".into()))
    }

    fn list_nodes(&self) -> NodeinitResult<Vec<NodeId>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// No backoff and short timeouts.
pub fn fast_options() -> SchedulerOptions {
    SchedulerOptions {
        max_in_flight: 8,
        max_attempts: 3,
        retry: RetryPolicy::immediate(),
        timeouts: StageTimeouts {
            local_ms: 50,
            routed_ms: 50,
        },
        controller_id: CONTROLLER,
    }
}

/// EmptyNode, Ping, Details (static), Associations (optional), Done.
pub fn example_catalog() -> StageCatalog {
    StageCatalog::new(
        vec![
            StageSpec::new(Stage::EmptyNode, 0, StageFlags::mandatory_dynamic(), Reach::Local),
            StageSpec::new(Stage::Ping, 1, StageFlags::mandatory_dynamic(), Reach::Routed),
            StageSpec::new(Stage::Details, 2, StageFlags::mandatory_static(), Reach::Routed),
            StageSpec::new(
                Stage::Associations,
                3,
                StageFlags::optional_dynamic(),
                Reach::Routed,
            ),
            StageSpec::new(Stage::Done, 4, StageFlags::mandatory_dynamic(), Reach::Local),
        ],
        Stage::Associations,
    )
    .expect("valid catalog")
}

pub struct Harness {
    pub scheduler: Arc<SessionScheduler>,
    pub transport: Arc<ScriptedTransport>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<dyn StaticDataStore>,
}

impl Harness {
    pub fn new(catalog: StageCatalog, store: Arc<dyn StaticDataStore>) -> Self {
        Self::with(catalog, store, Arc::new(ScriptedTransport::default()), fast_options())
    }

    pub fn with(
        catalog: StageCatalog,
        store: Arc<dyn StaticDataStore>,
        transport: Arc<ScriptedTransport>,
        options: SchedulerOptions,
    ) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Arc::new(SessionScheduler::new(
            Arc::new(catalog),
            transport.clone(),
            store.clone(),
            sink.clone(),
            options,
        ));
        Self {
            scheduler,
            transport,
            sink,
            store,
        }
    }

    /// Wait for a node to settle, failing the test after five seconds.
    pub async fn settle(&self, node: NodeId) -> NodeMode {
        let mut rx = self.scheduler.watch(node).expect("node attached");
        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|snapshot| snapshot.mode.is_settled()),
        )
        .await
        .expect("node settled in time")
        .expect("node still attached");
        waited.mode
    }
}
