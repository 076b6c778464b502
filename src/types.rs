//! Core data model: tables, typed record bodies, sync state and status counts.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Table
// ============================================================================

/// Entity tables known to the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Customer,
    Order,
    OrderItem,
    MeasurementSet,
}

impl Table {
    /// Every table, parents before children.
    pub const ALL: [Table; 4] = [
        Table::Customer,
        Table::Order,
        Table::OrderItem,
        Table::MeasurementSet,
    ];

    /// Collection / remote relation name.
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Customer => "customers",
            Table::Order => "orders",
            Table::OrderItem => "order_items",
            Table::MeasurementSet => "measurement_sets",
        }
    }

    /// Singular noun used in human-readable reasons.
    pub fn label(self) -> &'static str {
        match self {
            Table::Customer => "customer",
            Table::Order => "order",
            Table::OrderItem => "order item",
            Table::MeasurementSet => "measurement set",
        }
    }

    pub fn parent(self) -> Option<Table> {
        match self {
            Table::Customer => None,
            Table::Order | Table::MeasurementSet => Some(Table::Customer),
            Table::OrderItem => Some(Table::Order),
        }
    }

    pub fn children(self) -> Vec<Table> {
        Table::ALL
            .into_iter()
            .filter(|t| t.parent() == Some(self))
            .collect()
    }

    /// Whether records carry a user-facing ordinal.
    pub fn has_sequence_number(self) -> bool {
        matches!(self, Table::Order)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sync State
// ============================================================================

/// Why a record could not be pushed. Displayed verbatim to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("parent not yet available")]
    ParentUnavailable { parent: Table },

    #[error("orphaned: missing parent {}", parent.label())]
    Orphaned { parent: Table },

    #[error("sequence numbers exhausted after {probes} probes starting at {start}")]
    SequenceExhausted { start: i64, probes: u32 },

    #[error("rejected by remote: {message}")]
    Constraint { message: String },
}

/// Sync lifecycle of a record. The failure reason only exists in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Synced,
    Failed(FailureReason),
    Deleted,
}

/// Field-less mirror of `SyncState` used for queries and counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStateKind {
    Pending,
    Synced,
    Failed,
    Deleted,
}

impl SyncState {
    pub fn kind(&self) -> SyncStateKind {
        match self {
            SyncState::Pending => SyncStateKind::Pending,
            SyncState::Synced => SyncStateKind::Synced,
            SyncState::Failed(_) => SyncStateKind::Failed,
            SyncState::Deleted => SyncStateKind::Deleted,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            SyncState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl SyncStateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStateKind::Pending => "pending",
            SyncStateKind::Synced => "synced",
            SyncStateKind::Failed => "failed",
            SyncStateKind::Deleted => "deleted",
        }
    }

    /// Survivor rank used by duplicate collapse (higher wins).
    pub fn keep_priority(self) -> u8 {
        match self {
            SyncStateKind::Synced => 3,
            SyncStateKind::Pending => 2,
            SyncStateKind::Failed => 1,
            SyncStateKind::Deleted => 0,
        }
    }
}

// ============================================================================
// Typed Bodies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Received,
    InProgress,
    Ready,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub customer_id: String,
    /// Denormalized contact of the customer, used to re-link orphans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default)]
    pub total_cents: i64,
    #[serde(default)]
    pub advance_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: String,
    /// Denormalized sequence number of the parent order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_number: Option<i64>,
    pub description: String,
    pub quantity: u32,
    #[serde(default)]
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSet {
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    pub label: String,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

/// One variant per table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum RecordBody {
    Customer(Customer),
    Order(Order),
    OrderItem(OrderItem),
    MeasurementSet(MeasurementSet),
}

impl RecordBody {
    pub fn table(&self) -> Table {
        match self {
            RecordBody::Customer(_) => Table::Customer,
            RecordBody::Order(_) => Table::Order,
            RecordBody::OrderItem(_) => Table::OrderItem,
            RecordBody::MeasurementSet(_) => Table::MeasurementSet,
        }
    }

    /// The stored parent reference, if this table has a parent.
    pub fn parent_ref(&self) -> Option<&str> {
        match self {
            RecordBody::Customer(_) => None,
            RecordBody::Order(o) => Some(&o.customer_id),
            RecordBody::OrderItem(i) => Some(&i.order_id),
            RecordBody::MeasurementSet(m) => Some(&m.customer_id),
        }
    }

    pub fn set_parent_ref(&mut self, value: impl Into<String>) {
        match self {
            RecordBody::Customer(_) => {}
            RecordBody::Order(o) => o.customer_id = value.into(),
            RecordBody::OrderItem(i) => i.order_id = value.into(),
            RecordBody::MeasurementSet(m) => m.customer_id = value.into(),
        }
    }

    /// Denormalized contact pointing at a parent customer.
    pub fn customer_phone(&self) -> Option<&str> {
        match self {
            RecordBody::Order(o) => o.customer_phone.as_deref(),
            RecordBody::MeasurementSet(m) => m.customer_phone.as_deref(),
            RecordBody::Customer(c) => c.phone.as_deref(),
            RecordBody::OrderItem(_) => None,
        }
    }

    /// Check required fields. Returns a human-readable message on failure.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            RecordBody::Customer(c) if c.name.trim().is_empty() => {
                Err("customer name is required".into())
            }
            RecordBody::Order(o) if o.customer_id.is_empty() => {
                Err("order must reference a customer".into())
            }
            RecordBody::OrderItem(i) if i.order_id.is_empty() => {
                Err("order item must reference an order".into())
            }
            RecordBody::OrderItem(i) if i.quantity == 0 => {
                Err("order item quantity must be positive".into())
            }
            RecordBody::MeasurementSet(m) if m.customer_id.is_empty() => {
                Err("measurement set must reference a customer".into())
            }
            RecordBody::MeasurementSet(m) if m.label.trim().is_empty() => {
                Err("measurement set label is required".into())
            }
            _ => Ok(()),
        }
    }

    /// Apply a JSON merge patch and re-validate the result into the same variant.
    pub fn merge_patch(&self, patch: &Value) -> std::result::Result<RecordBody, String> {
        let Some(patch_obj) = patch.as_object() else {
            return Err("patch must be a JSON object".into());
        };
        if let Some(table) = patch_obj.get("table") {
            if table.as_str() != Some(self.table_tag()) {
                return Err("patch cannot change the record's table".into());
            }
        }

        let mut merged = serde_json::to_value(self).map_err(|e| e.to_string())?;
        json_merge(&mut merged, patch);
        let body: RecordBody = serde_json::from_value(merged).map_err(|e| e.to_string())?;
        body.validate()?;
        Ok(body)
    }

    fn table_tag(&self) -> &'static str {
        match self {
            RecordBody::Customer(_) => "customer",
            RecordBody::Order(_) => "order",
            RecordBody::OrderItem(_) => "order_item",
            RecordBody::MeasurementSet(_) => "measurement_set",
        }
    }
}

/// RFC 7396 merge: `null` removes a key, objects merge recursively.
fn json_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_obj), Value::Object(patch_obj)) => {
            for (key, value) in patch_obj {
                if value.is_null() {
                    target_obj.remove(key);
                } else {
                    json_merge(
                        target_obj.entry(key.clone()).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

// ============================================================================
// Record
// ============================================================================

/// A stored record. `id` is the storage key; it starts as `local_id` and is
/// replaced by the remote identifier once the remote store commits under a
/// different one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub local_id: String,
    pub remote_id: Option<String>,
    /// Identifier minted for the first push of a sequence-numbered record and
    /// reused by every retry until the remote confirms it as `remote_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_id: Option<String>,
    pub sequence_number: Option<i64>,
    pub sync_state: SyncState,
    /// Bumped on every gateway mutation; lets sync results detect concurrent edits.
    pub revision: u64,
    pub body: RecordBody,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn table(&self) -> Table {
        self.body.table()
    }

    pub fn is_tombstone(&self) -> bool {
        self.sync_state == SyncState::Deleted
    }

    /// Whether `ident` names this record by key, local id or remote id.
    pub fn answers_to(&self, ident: &str) -> bool {
        self.id == ident
            || self.local_id == ident
            || self.remote_id.as_deref() == Some(ident)
            || self.outbound_id.as_deref() == Some(ident)
    }

    /// Identifier the remote store may hold this record under.
    pub fn remote_key(&self) -> &str {
        self.remote_id
            .as_deref()
            .or(self.outbound_id.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.sync_state = SyncState::Failed(reason);
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Predicate for `RecordStore::query`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordFilter {
    All,
    State(SyncStateKind),
    States(Vec<SyncStateKind>),
    SequenceNumber(i64),
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::State(kind) => record.sync_state.kind() == *kind,
            RecordFilter::States(kinds) => kinds.contains(&record.sync_state.kind()),
            RecordFilter::SequenceNumber(n) => record.sequence_number == Some(*n),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Aggregate counts for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    pub deleted: usize,
    pub total: usize,
}

impl TableStatus {
    pub fn count(&mut self, state: &SyncState) {
        match state.kind() {
            SyncStateKind::Pending => self.pending += 1,
            SyncStateKind::Synced => self.synced += 1,
            SyncStateKind::Failed => self.failed += 1,
            SyncStateKind::Deleted => self.deleted += 1,
        }
        self.total += 1;
    }
}

/// A failed record as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecord {
    pub table: Table,
    pub id: String,
    pub reason: String,
}

/// Sync status read by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub tables: BTreeMap<Table, TableStatus>,
    pub failures: Vec<FailedRecord>,
}

impl SyncStatus {
    pub fn table(&self, table: Table) -> TableStatus {
        self.tables.get(&table).copied().unwrap_or_default()
    }

    pub fn is_settled(&self) -> bool {
        self.tables
            .values()
            .all(|s| s.pending == 0 && s.failed == 0 && s.deleted == 0)
    }
}

// ============================================================================
// Tests
// ============================================================================
