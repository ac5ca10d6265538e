//! Per-node serialization, the global in-flight cap and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, ScriptedTransport, fast_options};
use nodeinit::catalog::{Stage, StageCatalog};
use nodeinit::events::NodeEvent;
use nodeinit::scheduler::RetryPolicy;
use nodeinit::session::NodeSession;
use nodeinit::store::MemoryStaticStore;
use nodeinit::{NodeMode, SchedulerOptions, StageTimeouts};
use nodeinit_shared::{FunctionId, NodeId, NodeinitError};

async fn wait_in_flight(transport: &ScriptedTransport, node: NodeId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.in_flight(node) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn slow_routed_options() -> SchedulerOptions {
    SchedulerOptions {
        timeouts: StageTimeouts {
            local_ms: 50,
            routed_ms: 30_000,
        },
        ..fast_options()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_drivers_never_overlap_on_one_node() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.set_delay(Duration::from_millis(5));
    let h = Harness::with(
        StageCatalog::standard(),
        Arc::new(MemoryStaticStore::new()),
        transport,
        fast_options(),
    );
    let node = NodeId::new(41);
    h.scheduler
        .attach(NodeSession::new(node, h.scheduler.catalog()))
        .unwrap();

    let runs: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = Arc::clone(&h.scheduler);
            tokio::spawn(async move { scheduler.run(node).await })
        })
        .collect();
    for run in runs {
        assert_eq!(run.await.unwrap().unwrap(), NodeMode::Ready);
    }

    assert_eq!(h.transport.max_in_flight_per_node(), 1);
    // Every stage ran exactly once despite eight loops.
    assert_eq!(
        h.scheduler.metrics().stages_executed_total(),
        StageCatalog::standard().len() as u64
    );
    let readies = h
        .sink
        .for_node(node)
        .iter()
        .filter(|event| matches!(event, NodeEvent::NodeReady { .. }))
        .count();
    assert_eq!(readies, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_cap_bounds_stages_in_flight() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.set_delay(Duration::from_millis(5));
    let options = SchedulerOptions {
        max_in_flight: 2,
        ..fast_options()
    };
    let h = Harness::with(
        StageCatalog::standard(),
        Arc::new(MemoryStaticStore::new()),
        transport,
        options,
    );

    let nodes: Vec<NodeId> = (50..56).map(NodeId::new).collect();
    for &node in &nodes {
        h.scheduler.include(node).unwrap();
    }
    for &node in &nodes {
        assert_eq!(h.settle(node).await, NodeMode::Ready);
    }

    assert!(h.transport.max_in_flight_total() <= 2);
    assert_eq!(h.transport.max_in_flight_per_node(), 1);
}

#[tokio::test]
async fn exclusion_cancels_a_stage_in_flight() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.hang_on(FunctionId::NodeInfo);
    let h = Harness::with(
        StageCatalog::standard(),
        Arc::new(MemoryStaticStore::new()),
        transport,
        slow_routed_options(),
    );
    let node = NodeId::new(42);

    h.scheduler.include(node).unwrap();
    wait_in_flight(&h.transport, node).await;
    assert_eq!(h.scheduler.snapshot(node).unwrap().stage, Stage::Details);

    tokio::time::timeout(Duration::from_secs(1), h.scheduler.exclude(node))
        .await
        .expect("exclusion does not wait for the stage timeout")
        .unwrap();

    assert_eq!(h.transport.in_flight(node), 0);
    assert!(matches!(
        h.scheduler.snapshot(node),
        Err(NodeinitError::NotFound(_))
    ));
    assert_eq!(h.sink.failed_count(node), 0);
    assert!(h.store.load(node).unwrap().is_empty());
    assert!(h.store.list_nodes().unwrap().is_empty());
}

#[tokio::test]
async fn force_fail_does_not_wait_out_a_backoff() {
    let options = SchedulerOptions {
        retry: RetryPolicy {
            base_ms: 10_000,
            max_ms: 10_000,
            multiplier: 1.0,
            min_jitter: 1.0,
        },
        ..fast_options()
    };
    let transport = Arc::new(ScriptedTransport::default());
    transport.drop_next(FunctionId::NodeInfo, 1);
    let h = Harness::with(
        StageCatalog::standard(),
        Arc::new(MemoryStaticStore::new()),
        transport,
        options,
    );
    let node = NodeId::new(44);

    h.scheduler.include(node).unwrap();
    let mut rx = h.scheduler.watch(node).unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.attempt == 1))
        .await
        .unwrap()
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(1),
        h.scheduler.force_fail(node, "operator"),
    )
    .await
    .expect("force_fail does not wait for the retry delay")
    .unwrap();

    assert_eq!(h.settle(node).await, NodeMode::Failed);
    let snapshot = h.scheduler.snapshot(node).unwrap();
    assert_eq!(snapshot.stage, Stage::Details);
    assert_eq!(snapshot.failure.as_deref(), Some("forced: operator"));
    assert_eq!(h.transport.calls(node, FunctionId::NodeInfo), 1);
    assert_eq!(h.sink.failed_count(node), 1);
}

#[tokio::test]
async fn excluded_node_can_join_again() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.hang_on(FunctionId::NodeInfo);
    let h = Harness::with(
        StageCatalog::standard(),
        Arc::new(MemoryStaticStore::new()),
        transport,
        slow_routed_options(),
    );
    let node = NodeId::new(43);

    h.scheduler.include(node).unwrap();
    wait_in_flight(&h.transport, node).await;
    h.scheduler.exclude(node).await.unwrap();

    let transport = Arc::new(ScriptedTransport::default());
    let h = Harness::with(
        StageCatalog::standard(),
        h.store.clone(),
        transport,
        fast_options(),
    );
    h.scheduler.include(node).unwrap();
    assert_eq!(h.settle(node).await, NodeMode::Ready);
}

#[tokio::test]
async fn shutdown_cancels_drivers_and_keeps_data() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.hang_on(FunctionId::NodeInfo);
    let h = Harness::with(
        StageCatalog::standard(),
        Arc::new(MemoryStaticStore::new()),
        transport,
        slow_routed_options(),
    );
    let nodes = [NodeId::new(44), NodeId::new(45)];
    for node in nodes {
        h.scheduler.include(node).unwrap();
    }
    for node in nodes {
        wait_in_flight(&h.transport, node).await;
    }

    tokio::time::timeout(Duration::from_secs(1), h.scheduler.shutdown())
        .await
        .expect("shutdown does not wait for stage timeouts");

    assert!(h.scheduler.node_ids().is_empty());
    for node in nodes {
        assert_eq!(h.transport.in_flight(node), 0);
        assert!(h.store.load(node).unwrap().contains_key(&Stage::ProtocolInfo));
        assert_eq!(h.sink.failed_count(node), 0);
    }
    assert_eq!(h.store.list_nodes().unwrap(), nodes.to_vec());

    assert!(matches!(
        h.scheduler.include(NodeId::new(46)),
        Err(NodeinitError::Cancelled(_))
    ));
}
