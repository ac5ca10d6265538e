//! Restart recovery from persisted static data.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use nodeinit::catalog::{Reach, Stage, StageCatalog, StageFlags, StageSpec};
use nodeinit::db::Database;
use nodeinit::store::{SqliteStaticStore, StaticDataStore};
use nodeinit::NodeMode;
use nodeinit_shared::frame::command_class;
use nodeinit_shared::{FunctionId, NodeId, TransportError};

fn sqlite_store(path: &Path) -> Arc<dyn StaticDataStore> {
    Arc::new(SqliteStaticStore::new(Database::open(path).unwrap()))
}

/// Four static discovery stages, then a dynamic tail.
fn static_prefix_catalog() -> StageCatalog {
    StageCatalog::new(
        vec![
            StageSpec::new(Stage::ProtocolInfo, 0, StageFlags::mandatory_static(), Reach::Local),
            StageSpec::new(Stage::Details, 1, StageFlags::mandatory_static(), Reach::Routed),
            StageSpec::new(Stage::Manufacturer, 2, StageFlags::mandatory_static(), Reach::Routed),
            StageSpec::new(Stage::Version, 3, StageFlags::optional_static(), Reach::Routed),
            StageSpec::new(Stage::Ping, 4, StageFlags::mandatory_dynamic(), Reach::Routed),
            StageSpec::new(Stage::Done, 5, StageFlags::mandatory_dynamic(), Reach::Local),
        ],
        Stage::Ping,
    )
    .unwrap()
}

#[tokio::test]
async fn resumes_at_first_stage_without_stored_result() {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&temp_dir.path().join("nodeinit.db"));
    let node = NodeId::new(21);
    let details = vec![command_class::BASIC, command_class::VERSION];
    store
        .save(node, Stage::ProtocolInfo, &[0xd3, 0x9c, 0x01, 0x04])
        .unwrap();
    store.save(node, Stage::Details, &details).unwrap();

    let h = Harness::new(static_prefix_catalog(), store);
    assert_eq!(h.scheduler.resume(node).unwrap(), Stage::Manufacturer);
    assert_eq!(h.settle(node).await, NodeMode::Ready);

    assert_eq!(h.transport.calls(node, FunctionId::ProtocolInfo), 0);
    assert_eq!(h.transport.calls(node, FunctionId::NodeInfo), 0);
    assert_eq!(h.transport.calls(node, FunctionId::ManufacturerSpecificGet), 1);
    // Version support comes from the stored node info.
    assert_eq!(h.transport.calls(node, FunctionId::VersionGet), 1);

    let stored = h.store.load(node).unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored.get(&Stage::Details), Some(&details));
}

#[tokio::test]
async fn restart_mid_initialization_skips_persisted_stages() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("nodeinit.db");
    let node = NodeId::new(22);

    let first = Harness::new(StageCatalog::standard(), sqlite_store(&db_path));
    first.transport.hang_on(FunctionId::ManufacturerSpecificGet);
    first.scheduler.include(node).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while first.transport.calls(node, FunctionId::ManufacturerSpecificGet) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    first.scheduler.shutdown().await;

    let persisted = first.store.load(node).unwrap();
    assert_eq!(
        persisted.keys().copied().collect::<Vec<_>>(),
        vec![Stage::ProtocolInfo, Stage::Details, Stage::SecurityReport]
    );

    let second = Harness::new(StageCatalog::standard(), sqlite_store(&db_path));
    assert_eq!(second.store.list_nodes().unwrap(), vec![node]);
    // EmptyNode is dynamic and always re-runs.
    assert_eq!(second.scheduler.resume(node).unwrap(), Stage::EmptyNode);
    assert_eq!(second.settle(node).await, NodeMode::Ready);

    let calls = |function| second.transport.calls(node, function);
    assert_eq!(calls(FunctionId::ProtocolInfo), 0);
    assert_eq!(calls(FunctionId::NodeInfo), 0);
    assert_eq!(calls(FunctionId::IsFailedNode), 1);
    assert_eq!(calls(FunctionId::NoOperation), 1);
    assert_eq!(calls(FunctionId::ManufacturerSpecificGet), 1);

    assert_eq!(second.store.load(node).unwrap().len(), 8);
    assert_eq!(
        second.scheduler.snapshot(node).unwrap().static_stages.len(),
        8
    );
}

#[tokio::test]
async fn failed_node_stays_failed_across_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("nodeinit.db");
    let node = NodeId::new(25);

    let first = Harness::new(StageCatalog::standard(), sqlite_store(&db_path));
    first.transport.fail_always(
        FunctionId::ManufacturerSpecificGet,
        TransportError::Rejected("unsupported".into()),
    );
    first.scheduler.include(node).unwrap();
    assert_eq!(first.settle(node).await, NodeMode::Failed);
    let failure = first.scheduler.snapshot(node).unwrap().failure;
    first.scheduler.shutdown().await;

    let second = Harness::new(StageCatalog::standard(), sqlite_store(&db_path));
    assert_eq!(second.scheduler.resume(node).unwrap(), Stage::Manufacturer);

    let snapshot = second.scheduler.snapshot(node).unwrap();
    assert_eq!(snapshot.mode, NodeMode::Failed);
    assert_eq!(snapshot.stage, Stage::Manufacturer);
    assert_eq!(snapshot.failure, failure);
    assert_eq!(snapshot.static_stages.len(), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second.transport.total_calls(FunctionId::IsFailedNode), 0);
    assert_eq!(second.transport.total_calls(FunctionId::ManufacturerSpecificGet), 0);
    assert_eq!(second.sink.failed_count(node), 0);
    assert!(second.sink.modes().contains(&(node, NodeMode::Failed)));

    // Only re-inclusion brings it back.
    second.scheduler.reinclude(node).await.unwrap();
    assert_eq!(second.settle(node).await, NodeMode::Ready);
    assert_eq!(second.store.load_failure(node).unwrap(), None);
    assert_eq!(second.store.load(node).unwrap().len(), 8);
}

#[tokio::test]
async fn fully_initialized_node_only_reruns_dynamic_stages() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("nodeinit.db");
    let node = NodeId::new(23);

    let first = Harness::new(static_prefix_catalog(), sqlite_store(&db_path));
    first.scheduler.include(node).unwrap();
    assert_eq!(first.settle(node).await, NodeMode::Ready);
    let before = first.store.load(node).unwrap();
    first.scheduler.shutdown().await;

    let second = Harness::new(static_prefix_catalog(), sqlite_store(&db_path));
    assert_eq!(second.scheduler.resume(node).unwrap(), Stage::Ping);
    assert_eq!(second.settle(node).await, NodeMode::Ready);

    assert_eq!(second.transport.calls(node, FunctionId::NoOperation), 1);
    assert_eq!(second.transport.calls(node, FunctionId::ManufacturerSpecificGet), 0);
    assert_eq!(second.transport.calls(node, FunctionId::VersionGet), 0);
    assert_eq!(second.store.load(node).unwrap(), before);
}

#[tokio::test]
async fn exclusion_clears_persisted_data() {
    let temp_dir = tempfile::tempdir().unwrap();
    let h = Harness::new(
        static_prefix_catalog(),
        sqlite_store(&temp_dir.path().join("nodeinit.db")),
    );
    let node = NodeId::new(24);

    h.scheduler.include(node).unwrap();
    assert_eq!(h.settle(node).await, NodeMode::Ready);
    assert_eq!(h.store.list_nodes().unwrap(), vec![node]);

    h.scheduler.exclude(node).await.unwrap();
    assert!(h.store.load(node).unwrap().is_empty());
    assert!(h.store.list_nodes().unwrap().is_empty());
}
