//! Orphan repair and duplicate collapse, followed by the passes that push them.

use atelier_sync::{
    remote::RemoteOp, storage::RecordStore, types::RecordFilter, RecordBody, RemoteRecord,
    SyncState, Table,
};
use chrono::Utc;

use crate::support::{customer, item, order, Harness};

#[tokio::test]
async fn order_item_without_order_is_left_failed_not_deleted() {
    let h = Harness::new();
    let orphan = h.gateway.create(item("no-such-order", None)).unwrap();

    let report = h.reconciler.run().await.unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(
        h.reason(Table::OrderItem, &orphan.id).as_deref(),
        Some("orphaned: missing parent order")
    );

    // Passes leave it alone until it is re-linked.
    h.orchestrator.run_pass().await;
    assert_eq!(
        h.reason(Table::OrderItem, &orphan.id).as_deref(),
        Some("orphaned: missing parent order")
    );
    assert!(h
        .remote
        .calls()
        .iter()
        .all(|c| !(c.op == RemoteOp::Upsert && c.table == Table::OrderItem)));
}

#[tokio::test]
async fn order_item_relinks_by_order_number() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    let parent = h.gateway.create(order("1")).unwrap();
    let orphan = h.gateway.create(item("lost", parent.sequence_number)).unwrap();

    let report = h.reconciler.run().await.unwrap();
    assert_eq!(report.relinked, 1);

    let relinked = h.record(Table::OrderItem, &orphan.id);
    assert_eq!(relinked.body.parent_ref(), Some(parent.id.as_str()));

    h.orchestrator.run_pass().await;
    assert_eq!(
        h.record(Table::OrderItem, &orphan.local_id).sync_state,
        SyncState::Synced
    );
}

#[tokio::test]
async fn orphaned_order_gets_a_placeholder_customer_and_syncs() {
    let h = Harness::new();
    let mut body = order("deleted-customer");
    if let RecordBody::Order(o) = &mut body {
        o.customer_phone = Some("+91 98450 12345".into());
    }
    let orphan = h.gateway.create(body).unwrap();

    let report = h.reconciler.run().await.unwrap();
    assert_eq!(report.placeholders_created, 1);
    assert_eq!(report.relinked, 1);

    let customers = h.gateway.list(Table::Customer).unwrap();
    assert_eq!(customers.len(), 1);
    let RecordBody::Customer(placeholder) = &customers[0].body else {
        panic!("expected a customer");
    };
    assert_eq!(placeholder.name, "Unknown customer");
    assert_eq!(placeholder.phone.as_deref(), Some("+91 98450 12345"));

    let pass = h.orchestrator.run_pass().await;
    assert_eq!(pass.pushed, 2);
    assert_eq!(
        h.record(Table::Order, &orphan.local_id).sync_state,
        SyncState::Synced
    );
}

#[tokio::test]
async fn parent_known_only_remotely_is_not_an_orphan() {
    let h = Harness::new();
    let now = Utc::now();
    h.remote.insert(RemoteRecord {
        id: "c-777".into(),
        sequence_number: None,
        body: customer("Meera", None),
        created_at: now,
        updated_at: now,
    });
    h.gateway.create(order("c-777")).unwrap();

    let report = h.reconciler.run().await.unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(h.remote.count(RemoteOp::Exists), 1);
}

#[tokio::test]
async fn racing_devices_collapse_to_one_order() {
    let h = Harness::new();
    h.gateway.create(customer("Asha", None)).unwrap();
    let ours = h.gateway.create(order("1")).unwrap();
    h.gateway.create(item(&ours.id, ours.sequence_number)).unwrap();
    h.orchestrator.run_pass().await;

    // Another device committed the same number while the unique check was off.
    h.remote.set_enforce_relations(false);
    let theirs = RemoteRecord {
        id: "their-order".into(),
        sequence_number: ours.sequence_number,
        body: order("1"),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.remote.insert(theirs);
    h.orchestrator.run_pass().await;
    assert_eq!(
        h.store.query(Table::Order, &RecordFilter::All).unwrap().len(),
        2
    );

    // Ours was edited after the push, so the pulled synced copy wins.
    h.gateway
        .update(Table::Order, &ours.local_id, &serde_json::json!({ "notes": "rush" }))
        .unwrap();

    let report = h.reconciler.run().await.unwrap();
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(
        h.record(Table::Order, &ours.local_id).sync_state,
        SyncState::Deleted
    );
    assert_eq!(h.record(Table::Order, "their-order").sync_state, SyncState::Synced);
    assert_eq!(
        h.store.status().unwrap().table(Table::OrderItem).deleted,
        1,
        "children of the losing order are tombstoned too"
    );

    let pass = h.orchestrator.run_pass().await;
    assert_eq!(pass.purged, 2);
    assert!(h.remote.row(Table::Order, "their-order").is_some());
    assert_eq!(h.remote.rows(Table::Order).len(), 1);
}

#[tokio::test]
async fn orphan_recovers_once_its_parent_is_pulled() {
    let h = Harness::new();
    let orphan = h.gateway.create(item("o-remote", None)).unwrap();
    h.reconciler.run().await.unwrap();
    assert_eq!(
        h.reason(Table::OrderItem, &orphan.id).as_deref(),
        Some("orphaned: missing parent order")
    );

    let now = Utc::now();
    h.remote.insert(RemoteRecord {
        id: "c-remote".into(),
        sequence_number: None,
        body: customer("Meera", None),
        created_at: now,
        updated_at: now,
    });
    h.remote.insert(RemoteRecord {
        id: "o-remote".into(),
        sequence_number: Some(5),
        body: order("c-remote"),
        created_at: now,
        updated_at: now,
    });
    h.orchestrator.run_pass().await;
    assert!(h.store.find(Table::Order, "o-remote").unwrap().is_some());

    let report = h.reconciler.run().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.orphaned, 0);
    assert_eq!(
        h.record(Table::OrderItem, &orphan.id).sync_state,
        SyncState::Pending
    );

    h.orchestrator.run_pass().await;
    let pushed = h.record(Table::OrderItem, &orphan.local_id);
    assert_eq!(pushed.sync_state, SyncState::Synced);
    assert_eq!(h.remote.rows(Table::OrderItem).len(), 1);
}
