//! Named end-to-end scenarios.

use atelier_sync::{
    remote::RemoteOp, storage::RecordStore, types::RecordFilter, RemoteError, SyncState, Table,
};

use crate::support::{customer, order, Harness};

#[tokio::test]
async fn asha_is_rekeyed_to_the_remote_identifier() {
    let h = Harness::new();
    h.remote.assign_ids(Table::Customer, "c");
    let asha = h.gateway.create(customer("Asha", Some("98450 12345"))).unwrap();
    assert_eq!(asha.local_id, "1");
    assert_eq!(asha.sync_state, SyncState::Pending);

    let report = h.orchestrator.run_pass().await;
    assert_eq!(report.pushed, 1);

    let synced = h.store.get(Table::Customer, "c-001").unwrap().unwrap();
    assert_eq!(synced.local_id, "1");
    assert_eq!(synced.remote_id.as_deref(), Some("c-001"));
    assert_eq!(synced.sync_state, SyncState::Synced);
    assert!(h.store.get(Table::Customer, "1").unwrap().is_none());

    // The gateway still answers to the id the UI was handed.
    let via_local = h.gateway.get(Table::Customer, "1").unwrap().unwrap();
    assert_eq!(via_local.id, "c-001");
}

#[tokio::test]
async fn order_waits_for_a_customer_that_failed_to_push() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    let created = h.gateway.create(order("1")).unwrap();
    let mut seven = created.clone();
    seven.sequence_number = Some(7);
    h.store.put(&seven).unwrap();
    h.remote
        .fail_row(Table::Customer, "1", RemoteError::transport("timed out"));

    let report = h.orchestrator.run_pass().await;
    assert!(report.needs_retry());

    let order = h.record(Table::Order, "2");
    assert_eq!(
        order.sync_state.failure().map(ToString::to_string).as_deref(),
        Some("parent not yet available")
    );
    assert_eq!(order.sequence_number, Some(7));
    assert!(h
        .remote
        .calls()
        .iter()
        .all(|c| c.table != Table::Order || c.op == RemoteOp::Select));
}

#[tokio::test]
async fn colliding_sequence_numbers_are_bumped() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    let first = h.gateway.create(order("1")).unwrap();
    let second = h.gateway.create(order("1")).unwrap();

    let mut first = first;
    first.sequence_number = Some(3);
    let mut second = second;
    second.sequence_number = Some(3);
    second.created_at = first.created_at + chrono::Duration::seconds(1);
    h.store.put(&first).unwrap();
    h.store.put(&second).unwrap();

    let report = h.orchestrator.run_pass().await;
    assert_eq!(report.pushed, 3);

    let first = h.record(Table::Order, &first.local_id);
    let second = h.record(Table::Order, &second.local_id);
    assert_eq!(first.sequence_number, Some(3));
    assert_eq!(second.sequence_number, Some(4));
    assert_eq!(first.sync_state, SyncState::Synced);
    assert_eq!(second.sync_state, SyncState::Synced);

    let mut remote_numbers: Vec<_> = h
        .remote
        .rows(Table::Order)
        .into_iter()
        .filter_map(|r| r.sequence_number)
        .collect();
    remote_numbers.sort_unstable();
    assert_eq!(remote_numbers, vec![3, 4]);
}

#[tokio::test]
async fn remote_collision_moves_to_next_free_number() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    h.orchestrator.run_pass().await;

    // Another device already holds 1 and 2.
    for (seq, id) in [(1, "other-1"), (2, "other-2")] {
        let mut row = atelier_sync::RemoteRecord::outbound(&h.record(Table::Customer, "1"), id);
        row.body = order("1");
        row.sequence_number = Some(seq);
        h.remote.insert(row);
    }

    let created = h.gateway.create(order("1")).unwrap();
    assert_eq!(created.sequence_number, Some(1));
    h.remote.clear_calls();

    h.orchestrator.run_pass().await;
    let pushed = h.record(Table::Order, &created.local_id);
    assert_eq!(pushed.sequence_number, Some(3));
    assert_eq!(h.remote.count(RemoteOp::Exists), 3);
}

#[tokio::test]
async fn lost_acknowledgement_does_not_duplicate_the_order() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    let created = h.gateway.create(order("1")).unwrap();
    h.remote.lose_next_ack(Table::Order);

    let first = h.orchestrator.run_pass().await;
    assert!(first.needs_retry());
    let waiting = h.record(Table::Order, &created.local_id);
    assert_eq!(waiting.sync_state, SyncState::Pending);
    assert!(waiting.remote_id.is_none());
    assert_eq!(h.remote.rows(Table::Order).len(), 1);

    for _ in 0..2 {
        h.orchestrator.run_pass().await;
    }

    let rows = h.remote.rows(Table::Order);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sequence_number, Some(1));

    let local = h.store.query(Table::Order, &RecordFilter::All).unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].local_id, created.local_id);
    assert_eq!(local[0].sync_state, SyncState::Synced);
    assert_eq!(local[0].remote_id.as_deref(), Some(rows[0].id.as_str()));
}
