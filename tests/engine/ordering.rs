//! Pass-level properties: ordering, idempotence, isolation, purge, aborts.

use std::sync::Arc;

use atelier_sync::{remote::RemoteOp, storage::RecordStore, RemoteError, SyncState, Table};

use crate::support::{customer, item, measurements, order, Harness};

/// Customer "1" with order "2", item "3" and measurement set "4".
fn seed_family(h: &Harness) {
    h.gateway.create(customer("Asha", Some("98450 12345"))).unwrap();
    h.gateway.create(order("1")).unwrap();
    h.gateway.create(item("2", Some(1))).unwrap();
    h.gateway.create(measurements("1")).unwrap();
}

fn upsert_positions(h: &Harness, table: Table) -> Vec<usize> {
    h.remote
        .calls()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.op == RemoteOp::Upsert && c.table == table)
        .map(|(i, _)| i)
        .collect()
}

// ============================================================================
// Ordering & idempotence
// ============================================================================

#[tokio::test]
async fn parents_are_pushed_before_children() {
    let h = Harness::new();
    h.remote.assign_ids(Table::Customer, "c");
    seed_family(&h);

    let report = h.orchestrator.run_pass().await;
    assert_eq!(report.pushed, 4);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let customers = upsert_positions(&h, Table::Customer);
    let orders = upsert_positions(&h, Table::Order);
    let items = upsert_positions(&h, Table::OrderItem);
    let sets = upsert_positions(&h, Table::MeasurementSet);
    assert!(customers.last() < orders.first());
    assert!(orders.last() < items.first());
    assert!(items.last() < sets.first());
}

#[tokio::test]
async fn foreign_keys_follow_rekeyed_parents() {
    let h = Harness::new();
    h.remote.assign_ids(Table::Customer, "c");
    seed_family(&h);
    h.orchestrator.run_pass().await;

    let order = h.record(Table::Order, "2");
    assert_eq!(order.body.parent_ref(), Some("c-001"));
    let remote_order = h
        .remote
        .row(Table::Order, order.remote_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(remote_order.body.parent_ref(), Some("c-001"));

    let set = h.record(Table::MeasurementSet, "4");
    assert_eq!(set.body.parent_ref(), Some("c-001"));
    assert_eq!(set.sync_state, SyncState::Synced);
}

#[tokio::test]
async fn second_pass_without_mutations_writes_nothing() {
    let h = Harness::new();
    h.remote.assign_ids(Table::Customer, "c");
    seed_family(&h);

    h.orchestrator.run_pass().await;
    h.remote.clear_calls();

    let report = h.orchestrator.run_pass().await;
    assert_eq!(h.remote.write_count(), 0);
    assert_eq!(h.remote.count(RemoteOp::Upsert), 0);
    assert_eq!(report.pushed, 0);
    assert_eq!(report.pulled + report.merged, 0);
    assert!(h.store.status().unwrap().is_settled());
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
async fn one_rejected_record_does_not_block_others() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap(); // 1
    h.gateway.create(customer("Ravi", None)).unwrap(); // 2
    h.gateway.create(order("1")).unwrap(); // 3
    h.gateway.create(order("2")).unwrap(); // 4
    h.remote
        .fail_row(Table::Customer, "1", RemoteError::constraint("email already registered"));

    let report = h.orchestrator.run_pass().await;
    assert!(!report.needs_retry());

    assert_eq!(
        h.reason(Table::Customer, "1").as_deref(),
        Some("rejected by remote: email already registered")
    );
    assert_eq!(h.record(Table::Customer, "2").sync_state, SyncState::Synced);
    assert_eq!(
        h.reason(Table::Order, "3").as_deref(),
        Some("parent not yet available")
    );
    assert_eq!(h.record(Table::Order, "4").sync_state, SyncState::Synced);
}

#[tokio::test]
async fn failed_records_are_retried_on_the_next_pass() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    h.remote
        .fail_row(Table::Customer, "1", RemoteError::constraint("phone already registered"));

    let first = h.orchestrator.run_pass().await;
    assert!(!first.needs_retry());
    assert_eq!(
        h.reason(Table::Customer, "1").as_deref(),
        Some("rejected by remote: phone already registered")
    );

    h.remote.clear_faults();
    let second = h.orchestrator.run_pass().await;
    assert_eq!(second.pushed, 1);
    assert_eq!(h.record(Table::Customer, "1").sync_state, SyncState::Synced);
}

#[tokio::test]
async fn network_blips_do_not_surface_as_failures() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    h.remote
        .fail_row(Table::Customer, "1", RemoteError::transport("connection reset"));

    let report = h.orchestrator.run_pass().await;
    assert!(report.needs_retry());
    assert_eq!(report.failed, 0);
    assert_eq!(h.record(Table::Customer, "1").sync_state, SyncState::Pending);
    assert!(h.store.status().unwrap().failures.is_empty());
}

// ============================================================================
// Tombstones
// ============================================================================

#[tokio::test]
async fn tombstone_is_purged_once_remote_delete_succeeds() {
    let h = Harness::new();
    h.remote.assign_ids(Table::Customer, "c");
    h.gateway.create(customer("Asha", None)).unwrap();
    h.orchestrator.run_pass().await;

    h.gateway.delete(Table::Customer, "1").unwrap();
    h.remote.set_unreachable(true);
    let failed = h.orchestrator.run_pass().await;
    assert_eq!(failed.purged, 0);
    assert_eq!(h.record(Table::Customer, "c-001").sync_state, SyncState::Deleted);
    assert!(h.remote.row(Table::Customer, "c-001").is_some());

    h.remote.set_unreachable(false);
    let purged = h.orchestrator.run_pass().await;
    assert_eq!(purged.purged, 1);
    assert!(h.store.find(Table::Customer, "1").unwrap().is_none());
    assert!(h.remote.row(Table::Customer, "c-001").is_none());

    let again = h.orchestrator.run_pass().await;
    assert_eq!(again.purged, 0);
    assert_eq!(h.remote.count(RemoteOp::Delete), 1);
}

#[tokio::test]
async fn never_pushed_tombstone_is_purged_on_not_found() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    h.gateway.delete(Table::Customer, "1").unwrap();

    let report = h.orchestrator.run_pass().await;
    assert_eq!(report.purged, 1);
    assert_eq!(report.pushed, 0);
    assert!(h.store.get(Table::Customer, "1").unwrap().is_none());
}

// ============================================================================
// Table-level errors & connectivity
// ============================================================================

#[tokio::test]
async fn missing_remote_table_is_skipped() {
    let h = Harness::new();
    seed_family(&h);
    h.remote.set_table_missing(Table::OrderItem, true);

    let report = h.orchestrator.run_pass().await;
    assert_eq!(report.skipped_tables, vec![Table::OrderItem]);
    assert!(!report.needs_retry());
    assert_eq!(h.record(Table::OrderItem, "3").sync_state, SyncState::Pending);
    assert_eq!(h.record(Table::MeasurementSet, "4").sync_state, SyncState::Synced);
}

#[tokio::test]
async fn connectivity_loss_aborts_the_rest_of_the_pass() {
    let h = Harness::new();
    seed_family(&h);
    let connectivity = h.connectivity.clone();
    h.remote.set_call_hook(Some(Arc::new(move |op: RemoteOp, table: Table| {
        if op == RemoteOp::Upsert && table == Table::Order {
            connectivity.set_online(false);
        }
    })));

    let report = h.orchestrator.run_pass().await;
    assert!(report.aborted);
    assert!(report.needs_retry());
    assert_eq!(h.record(Table::Customer, "1").sync_state, SyncState::Synced);
    assert_eq!(h.record(Table::OrderItem, "3").sync_state, SyncState::Pending);
    assert_eq!(h.record(Table::MeasurementSet, "4").sync_state, SyncState::Pending);
    assert!(upsert_positions(&h, Table::OrderItem).is_empty());
}
