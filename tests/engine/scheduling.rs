//! The wired-up `Syncer`: debounce, reconnect, retry and manual sync, on paused time.

use std::sync::Arc;
use std::time::Duration;

use atelier_sync::{
    sync::SchedulerState, MemoryRemote, MemoryStore, RecordStore, SyncConfig, SyncState, Syncer,
    Table,
};

use crate::support::{customer, item, order};

fn syncer(config: SyncConfig) -> (Syncer, Arc<MemoryStore>, MemoryRemote) {
    let store = Arc::new(MemoryStore::new());
    let remote = MemoryRemote::new();
    let syncer = Syncer::new(
        store.clone(),
        Arc::new(remote.clone()),
        atelier_sync::ConnectivityMonitor::new(true),
        config,
    )
    .unwrap();
    (syncer, store, remote)
}

#[tokio::test(start_paused = true)]
async fn burst_of_edits_is_synced_by_one_pass() {
    let (syncer, _, _) = syncer(SyncConfig::default());
    syncer.start();

    let asha = syncer.gateway().create(customer("Asha", None)).unwrap();
    for n in 0..5 {
        syncer
            .gateway()
            .update(
                Table::Customer,
                &asha.id,
                &serde_json::json!({ "notes": format!("fitting {n}") }),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(syncer.scheduler_state(), SchedulerState::Armed);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(syncer.scheduler().stats().passes, 1);
    assert!(syncer.status().unwrap().is_settled());
    syncer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn edits_made_offline_sync_on_reconnect() {
    let (syncer, _, remote) = syncer(SyncConfig::default());
    syncer.start();
    syncer.set_online(false);

    let asha = syncer.gateway().create(customer("Asha", None)).unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(syncer.scheduler().stats().passes, 0);
    assert!(remote.calls().is_empty());

    syncer.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(syncer.scheduler().stats().passes, 1);
    let synced = syncer.gateway().get(Table::Customer, &asha.id).unwrap().unwrap();
    assert_eq!(synced.sync_state, SyncState::Synced);
    syncer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unreachable_remote_is_retried_after_backoff() {
    let (syncer, _, remote) = syncer(SyncConfig::default());
    syncer.start();
    remote.set_unreachable(true);

    syncer.gateway().create(customer("Asha", None)).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    let first = syncer.scheduler().last_report().unwrap();
    assert!(first.needs_retry());
    assert_eq!(syncer.status().unwrap().table(Table::Customer).pending, 1);

    remote.set_unreachable(false);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(syncer.scheduler().stats().passes, 2);
    assert_eq!(syncer.scheduler().stats().retries_scheduled, 1);
    assert!(syncer.status().unwrap().is_settled());
    syncer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn manual_sync_absorbs_the_armed_timer() {
    let (syncer, store, remote) = syncer(SyncConfig::default());
    remote.set_latency(Some(Duration::from_millis(50)));
    syncer.start();

    let asha = syncer.gateway().create(customer("Asha", None)).unwrap();
    let order = syncer.gateway().create(order(&asha.id)).unwrap();
    syncer
        .gateway()
        .create(item(&order.id, order.sequence_number))
        .unwrap();

    let report = syncer.force_sync_now().await.unwrap();
    assert_eq!(report.pushed, 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(syncer.scheduler().stats().passes, 1);
    assert_eq!(store.status().unwrap().table(Table::OrderItem).synced, 1);
    syncer.stop().await.unwrap();
}

#[tokio::test]
async fn manual_sync_needs_a_started_syncer() {
    let (syncer, _, _) = syncer(SyncConfig::default());
    assert!(matches!(
        syncer.force_sync_now().await,
        Err(atelier_sync::AtelierError::NotRunning)
    ));
}

#[tokio::test(start_paused = true)]
async fn periodic_reconciliation_marks_orphans() {
    let config = SyncConfig {
        reconcile_interval_ms: 60_000,
        ..Default::default()
    };
    let (syncer, _, _) = syncer(config);
    syncer.start();

    let orphan = syncer.gateway().create(item("gone", None)).unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let status = syncer.status().unwrap();
    assert_eq!(status.table(Table::OrderItem).failed, 1);
    assert_eq!(status.failures[0].id, orphan.id);
    assert_eq!(status.failures[0].reason, "orphaned: missing parent order");
    syncer.stop().await.unwrap();
}

#[test]
fn invalid_config_is_rejected() {
    let result = Syncer::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryRemote::new()),
        atelier_sync::ConnectivityMonitor::new(true),
        SyncConfig {
            debounce_ms: 0,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(atelier_sync::AtelierError::Config(_))));
}
