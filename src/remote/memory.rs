//! MemoryRemote: in-process `RemoteStore` with relational checks and fault
//! injection. Backs the test suite and local demos.
//!
//! Enforces what a relational backend would: parent rows must exist for child
//! rows, and `sequence_number` is unique per table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::types::Table;

use super::{DeleteOutcome, RemoteError, RemoteFilter, RemoteRecord, RemoteStore};

/// Kind of remote call, for the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Upsert,
    Delete,
    Exists,
    Select,
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub table: Table,
    /// Row id for upsert/delete, probed value for exists, empty for select.
    pub key: String,
    /// Whether the call committed a change.
    pub wrote: bool,
}

/// Observer invoked at the start of every call (before faults are applied).
pub type CallHook = dyn Fn(RemoteOp, Table) + Send + Sync;

#[derive(Default)]
struct State {
    rows: HashMap<Table, BTreeMap<String, RemoteRecord>>,
    missing_tables: HashSet<Table>,
    id_prefixes: HashMap<Table, String>,
    id_counters: HashMap<Table, u64>,
    unreachable: bool,
    table_faults: HashMap<Table, RemoteError>,
    row_faults: HashMap<(Table, String), RemoteError>,
    /// Upserts per table that commit but whose reply is dropped.
    lost_acks: HashMap<Table, usize>,
    enforce_relations: bool,
    latency: Option<Duration>,
    calls: Vec<RemoteCall>,
}

/// In-memory remote backend.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
    hook: Arc<Mutex<Option<Arc<CallHook>>>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                enforce_relations: true,
                ..Default::default()
            })),
            hook: Arc::new(Mutex::new(None)),
        }
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Assign `"{prefix}-{n:03}"` identifiers to rows upserted under an unknown id.
    pub fn assign_ids(&self, table: Table, prefix: impl Into<String>) {
        self.state.lock().id_prefixes.insert(table, prefix.into());
    }

    /// Seed a row without logging a call.
    pub fn insert(&self, record: RemoteRecord) {
        let mut state = self.state.lock();
        state
            .rows
            .entry(record.table())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn set_table_missing(&self, table: Table, missing: bool) {
        let mut state = self.state.lock();
        if missing {
            state.missing_tables.insert(table);
        } else {
            state.missing_tables.remove(&table);
        }
    }

    /// Every call fails with a transport error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Every upsert into `table` fails with `error`.
    pub fn fail_upserts(&self, table: Table, error: RemoteError) {
        self.state.lock().table_faults.insert(table, error);
    }

    /// Upserts of the row sent under `id` fail with `error`.
    pub fn fail_row(&self, table: Table, id: impl Into<String>, error: RemoteError) {
        self.state.lock().row_faults.insert((table, id.into()), error);
    }

    /// The next upsert into `table` commits, then fails with a transport error
    /// as if the reply was lost on the way back.
    pub fn lose_next_ack(&self, table: Table) {
        *self.state.lock().lost_acks.entry(table).or_insert(0) += 1;
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.unreachable = false;
        state.table_faults.clear();
        state.row_faults.clear();
        state.lost_acks.clear();
    }

    pub fn set_enforce_relations(&self, enforce: bool) {
        self.state.lock().enforce_relations = enforce;
    }

    /// Simulated round-trip delay applied to every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    pub fn set_call_hook(&self, hook: Option<Arc<CallHook>>) {
        *self.hook.lock() = hook;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn rows(&self, table: Table) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .rows
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: Table, id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .rows
            .get(&table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls that committed a change.
    pub fn write_count(&self) -> usize {
        self.state.lock().calls.iter().filter(|c| c.wrote).count()
    }

    pub fn count(&self, op: RemoteOp) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn enter(&self, op: RemoteOp, table: Table) -> std::result::Result<(), RemoteError> {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(op, table);
        }

        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let state = self.state.lock();
        if state.unreachable {
            return Err(RemoteError::transport("remote store unreachable"));
        }
        if state.missing_tables.contains(&table) {
            return Err(RemoteError::schema(format!(
                "relation \"{}\" does not exist",
                table.as_str()
            )));
        }
        Ok(())
    }

    fn take_lost_ack(&self, table: Table) -> bool {
        let mut state = self.state.lock();
        match state.lost_acks.get_mut(&table) {
            Some(pending) if *pending > 0 => {
                *pending -= 1;
                true
            }
            _ => false,
        }
    }

    fn log(&self, op: RemoteOp, table: Table, key: impl Into<String>, wrote: bool) {
        self.state.lock().calls.push(RemoteCall {
            op,
            table,
            key: key.into(),
            wrote,
        });
    }
}

fn check_relations(state: &State, record: &RemoteRecord) -> std::result::Result<(), RemoteError> {
    let table = record.table();
    if let (Some(parent), Some(parent_id)) = (table.parent(), record.body.parent_ref()) {
        let exists = state
            .rows
            .get(&parent)
            .is_some_and(|rows| rows.contains_key(parent_id));
        if !exists {
            return Err(RemoteError::constraint(format!(
                "foreign key violation: {} \"{}\" does not exist",
                parent.label(),
                parent_id
            )));
        }
    }

    if let Some(seq) = record.sequence_number {
        let taken = state.rows.get(&table).is_some_and(|rows| {
            rows.values()
                .any(|r| r.sequence_number == Some(seq) && r.id != record.id)
        });
        if taken {
            return Err(RemoteError::constraint(format!(
                "duplicate sequence_number {seq} in {table}"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(
        &self,
        table: Table,
        record: &RemoteRecord,
    ) -> std::result::Result<RemoteRecord, RemoteError> {
        if let Err(e) = self.enter(RemoteOp::Upsert, table).await {
            self.log(RemoteOp::Upsert, table, &record.id, false);
            return Err(e);
        }

        let result = {
            let mut state = self.state.lock();
            let fault = state
                .row_faults
                .get(&(table, record.id.clone()))
                .or_else(|| state.table_faults.get(&table))
                .cloned();

            match fault {
                Some(error) => Err(error),
                None => {
                    let known = state
                        .rows
                        .get(&table)
                        .is_some_and(|rows| rows.contains_key(&record.id));
                    let mut committed = record.clone();
                    if !known {
                        if let Some(prefix) = state.id_prefixes.get(&table).cloned() {
                            let counter = state.id_counters.entry(table).or_insert(0);
                            *counter += 1;
                            committed.id = format!("{prefix}-{:03}", *counter);
                        }
                    }
                    committed.updated_at = Utc::now();

                    let relations = if state.enforce_relations {
                        check_relations(&state, &committed)
                    } else {
                        Ok(())
                    };
                    relations.map(|()| {
                        state
                            .rows
                            .entry(table)
                            .or_default()
                            .insert(committed.id.clone(), committed.clone());
                        committed
                    })
                }
            }
        };

        self.log(RemoteOp::Upsert, table, &record.id, result.is_ok());
        if result.is_ok() && self.take_lost_ack(table) {
            return Err(RemoteError::transport("connection reset before reply"));
        }
        result
    }

    async fn delete(
        &self,
        table: Table,
        id: &str,
    ) -> std::result::Result<DeleteOutcome, RemoteError> {
        if let Err(e) = self.enter(RemoteOp::Delete, table).await {
            self.log(RemoteOp::Delete, table, id, false);
            return Err(e);
        }

        let removed = self
            .state
            .lock()
            .rows
            .get_mut(&table)
            .and_then(|rows| rows.remove(id))
            .is_some();
        self.log(RemoteOp::Delete, table, id, removed);

        Ok(if removed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    async fn exists(
        &self,
        table: Table,
        field: &str,
        value: &Value,
    ) -> std::result::Result<bool, RemoteError> {
        let result = self.enter(RemoteOp::Exists, table).await.map(|()| {
            self.state.lock().rows.get(&table).is_some_and(|rows| {
                rows.values()
                    .any(|r| r.field(field).as_ref() == Some(value))
            })
        });
        self.log(RemoteOp::Exists, table, value.to_string(), false);
        result
    }

    async fn select(
        &self,
        table: Table,
        filter: &RemoteFilter,
    ) -> std::result::Result<Vec<RemoteRecord>, RemoteError> {
        let result = self.enter(RemoteOp::Select, table).await.map(|()| {
            let state = self.state.lock();
            let mut rows: Vec<RemoteRecord> = state
                .rows
                .get(&table)
                .map(|rows| {
                    rows.values()
                        .filter(|r| {
                            filter
                                .updated_since
                                .is_none_or(|since| r.updated_at >= since)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
            if let Some(limit) = filter.limit {
                rows.truncate(limit);
            }
            rows
        });
        self.log(RemoteOp::Select, table, "", false);
        result
    }
}
