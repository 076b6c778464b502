//! Shared fixtures: a store, a scripted remote and the engine parts between them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use atelier_sync::{
    storage::RecordStore,
    sync::{ConnectivityMonitor, Reconciler, SyncOrchestrator, SyncTrigger},
    Customer, MeasurementSet, MemoryRemote, MemoryStore, MutationGateway, Order, OrderItem,
    OrderStatus, Record, RecordBody, SyncConfig, Table,
};

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub remote: MemoryRemote,
    pub connectivity: ConnectivityMonitor,
    pub gateway: Arc<MutationGateway>,
    pub orchestrator: SyncOrchestrator,
    pub reconciler: Reconciler,
}

impl Harness {
    /// Local ids are handed out as "1", "2", ... so tests can name them.
    pub fn new() -> Self {
        let config = SyncConfig::default();
        let store = Arc::new(MemoryStore::new());
        let remote = MemoryRemote::new();
        let connectivity = ConnectivityMonitor::new(true);
        let counter = AtomicU32::new(0);
        let gateway = Arc::new(
            MutationGateway::new(store.clone(), SyncTrigger::detached()).with_id_generator(
                move || (counter.fetch_add(1, Ordering::SeqCst) + 1).to_string(),
            ),
        );
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            Arc::new(remote.clone()),
            connectivity.clone(),
            &config,
        );
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(remote.clone()),
            connectivity.clone(),
            gateway.clone(),
            &config,
        );
        Self {
            store,
            remote,
            connectivity,
            gateway,
            orchestrator,
            reconciler,
        }
    }

    pub fn record(&self, table: Table, ident: &str) -> Record {
        self.store
            .find(table, ident)
            .unwrap()
            .unwrap_or_else(|| panic!("no {table} record answers to {ident}"))
    }

    pub fn reason(&self, table: Table, ident: &str) -> Option<String> {
        self.record(table, ident)
            .sync_state
            .failure()
            .map(ToString::to_string)
    }
}

// ============================================================================
// Bodies
// ============================================================================

pub fn customer(name: &str, phone: Option<&str>) -> RecordBody {
    RecordBody::Customer(Customer {
        name: name.into(),
        phone: phone.map(str::to_string),
        email: None,
        address: None,
        notes: None,
    })
}

pub fn order(customer_id: &str) -> RecordBody {
    RecordBody::Order(Order {
        customer_id: customer_id.into(),
        customer_phone: None,
        status: OrderStatus::Received,
        due_date: None,
        total_cents: 6_000,
        advance_cents: 1_000,
        notes: None,
    })
}

pub fn item(order_id: &str, order_number: Option<i64>) -> RecordBody {
    RecordBody::OrderItem(OrderItem {
        order_id: order_id.into(),
        order_number,
        description: "Salwar suit".into(),
        quantity: 2,
        unit_price_cents: 3_000,
    })
}

pub fn measurements(customer_id: &str) -> RecordBody {
    RecordBody::MeasurementSet(MeasurementSet {
        customer_id: customer_id.into(),
        customer_phone: None,
        label: "Kurta".into(),
        values: [("chest".to_string(), 38.5), ("sleeve".to_string(), 23.0)]
            .into_iter()
            .collect(),
    })
}
