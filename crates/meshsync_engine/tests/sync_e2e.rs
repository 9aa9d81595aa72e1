//! End-to-end data sync between two engines on a virtual network.

use meshsync_engine::{OperationStatus, State, SyncError, SyncRequest};
use meshsync_protocol::{QueryObject, SyncMode};
use meshsync_testkit::prelude::*;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn pair(a_storage: MemoryStorage, b_storage: MemoryStorage) -> (VirtualHub, TestDevice, TestDevice) {
    init_tracing();
    let hub = VirtualHub::new();
    let a = TestDevice::spawn(&hub, "dev-a", a_storage, test_config("dev-a")).unwrap();
    let b = TestDevice::spawn(&hub, "dev-b", b_storage, test_config("dev-b")).unwrap();
    (hub, a, b)
}

fn sync(device: &TestDevice, peer: &str, request: SyncRequest) -> OperationStatus {
    let report = device.engine.sync(request).unwrap().wait(WAIT).unwrap();
    report[peer]
}

#[test]
fn push_copies_entries_and_returns_to_idle() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    for i in 0..5 {
        a.storage.put(format!("k{i}"), format!("v{i}"));
    }

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));

    assert_eq!(status, OperationStatus::FinishedAll);
    assert_eq!(b.storage.len(), 5);
    assert_eq!(b.storage.get(b"k3"), Some(b"v3".to_vec()));
    assert!(eventually(|| a.engine.machine_state("dev-b") == Some(State::Idle)));
}

#[test]
fn push_spans_several_packets() {
    init_tracing();
    let hub = VirtualHub::new();
    let a = TestDevice::spawn(&hub, "dev-a", MemoryStorage::new(), test_config("dev-a").with_page_size(2)).unwrap();
    let b = TestDevice::spawn(&hub, "dev-b", MemoryStorage::new(), test_config("dev-b")).unwrap();
    for i in 0..9u8 {
        a.storage.put(format!("k{i}"), vec![i; 8]);
    }

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));

    assert_eq!(status, OperationStatus::FinishedAll);
    assert_eq!(b.storage.len(), 9);
    assert!(b.storage.put_batches() >= 5);
}

#[test]
fn pull_fetches_peer_entries() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    b.storage.put("remote", "value");

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Pull));

    assert_eq!(status, OperationStatus::FinishedAll);
    assert_eq!(a.storage.get(b"remote"), Some(b"value".to_vec()));
    assert!(eventually(|| a.engine.machine_state("dev-b") == Some(State::Idle)));
    assert!(eventually(|| b.engine.machine_state("dev-a") == Some(State::Idle)));
}

#[test]
fn push_and_pull_exchanges_both_sides() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    a.storage.put("from-a", "1");
    b.storage.put("from-b", "2");

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::PushAndPull));

    assert_eq!(status, OperationStatus::FinishedAll);
    assert_eq!(a.storage.get(b"from-b"), Some(b"2".to_vec()));
    assert_eq!(b.storage.get(b"from-a"), Some(b"1".to_vec()));
}

#[test]
fn repeated_push_without_changes_is_skipped() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    a.storage.put("k", "v");
    let push = || SyncRequest::new(vec!["dev-b".into()], SyncMode::Push);

    assert_eq!(sync(&a, "dev-b", push()), OperationStatus::FinishedAll);
    let batches = b.storage.put_batches();

    assert_eq!(sync(&a, "dev-b", push()), OperationStatus::FinishedAll);
    assert_eq!(b.storage.put_batches(), batches);

    a.storage.put("k2", "v2");
    assert_eq!(sync(&a, "dev-b", push()), OperationStatus::FinishedAll);
    assert_eq!(b.storage.get(b"k2"), Some(b"v2".to_vec()));
}

#[test]
fn query_push_sends_matching_keys_only() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    a.storage.put("user/1", "alice");
    a.storage.put("order/1", "book");
    let query = QueryObject::new().with_prefix("user/");

    let status = sync(
        &a,
        "dev-b",
        SyncRequest::new(vec!["dev-b".into()], SyncMode::QueryPush).with_query(query),
    );

    assert_eq!(status, OperationStatus::FinishedAll);
    assert_eq!(b.storage.get(b"user/1"), Some(b"alice".to_vec()));
    assert_eq!(b.storage.get(b"order/1"), None);
}

#[test]
fn schema_mismatch_on_save_fails_the_task() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    a.storage.put("k", "v");
    b.storage.fail_puts_with(Some(SyncError::SchemaMismatch));

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));

    assert_eq!(status, OperationStatus::SchemaIncompatible);
    assert!(eventually(|| a.engine.machine_state("dev-b") == Some(State::Idle)));
}

#[test]
fn schema_mismatch_on_read_fails_the_task() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    a.storage.put("k", "v");
    a.storage.fail_gets_with(Some(SyncError::SchemaMismatch));

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));

    assert_eq!(status, OperationStatus::SchemaIncompatible);
    assert!(eventually(|| a.engine.machine_state("dev-b") == Some(State::Idle)));
    assert!(b.storage.is_empty());

    a.storage.fail_gets_with(None);
    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));
    assert_eq!(status, OperationStatus::FinishedAll);
    assert_eq!(b.storage.get(b"k"), Some(b"v".to_vec()));
}

#[test]
fn different_schemas_never_sync() {
    let (_hub, a, b) = pair(
        MemoryStorage::new().with_schema("v1"),
        MemoryStorage::new().with_schema("v2"),
    );
    a.storage.put("k", "v");

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));

    assert_eq!(status, OperationStatus::SchemaIncompatible);
    assert!(b.storage.is_empty());
}

#[test]
fn unreachable_peer_reports_comm_failure() {
    let (hub, a, _b) = pair(MemoryStorage::new(), MemoryStorage::new());
    hub.set_online("dev-b", false);

    let status = sync(&a, "dev-b", SyncRequest::new(vec!["dev-b".into()], SyncMode::Push));

    assert!(status.is_terminal());
    assert_ne!(status, OperationStatus::FinishedAll);
    assert!(eventually(|| a.engine.machine_state("dev-b") == Some(State::Idle)));
}

#[test]
fn tasks_for_one_peer_run_in_order() {
    let (_hub, a, b) = pair(MemoryStorage::new(), MemoryStorage::new());
    a.storage.put("k", "v");
    let first = a
        .engine
        .sync(SyncRequest::new(vec!["dev-b".into()], SyncMode::Push))
        .unwrap();
    let second = a
        .engine
        .sync(SyncRequest::new(vec!["dev-b".into()], SyncMode::Pull))
        .unwrap();
    assert!(first.sync_id() < second.sync_id());

    assert_eq!(first.wait(WAIT).unwrap()["dev-b"], OperationStatus::FinishedAll);
    assert_eq!(second.wait(WAIT).unwrap()["dev-b"], OperationStatus::FinishedAll);
    assert_eq!(b.storage.get(b"k"), Some(b"v".to_vec()));
}

#[test]
fn closing_the_engine_finishes_pending_operations() {
    let (hub, a, _b) = pair(MemoryStorage::new(), MemoryStorage::new());
    hub.set_drop_filter(|_, _, _| true);
    a.storage.put("k", "v");
    let handle = a
        .engine
        .sync(SyncRequest::new(vec!["dev-b".into()], SyncMode::Push))
        .unwrap();

    a.engine.close();

    let report = handle.wait(WAIT).unwrap();
    assert!(report["dev-b"].is_terminal());
    assert_eq!(
        a.engine
            .sync(SyncRequest::new(vec!["dev-b".into()], SyncMode::Push))
            .unwrap_err(),
        SyncError::Busy
    );
}
