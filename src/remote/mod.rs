//! Remote store interface: generic upsert / delete / exists / select over the
//! backend's relations. The wire format is up to the implementation.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{Record, RecordBody, Table};

pub use memory::{MemoryRemote, RemoteCall, RemoteOp};

// ============================================================================
// RemoteStore: user-provided backend
// ============================================================================

/// User-implemented access to the remote relational backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert or update a row. Returns the committed row, whose `id` may differ
    /// from the one sent when the backend assigns identifiers.
    async fn upsert(
        &self,
        table: Table,
        record: &RemoteRecord,
    ) -> std::result::Result<RemoteRecord, RemoteError>;

    async fn delete(
        &self,
        table: Table,
        id: &str,
    ) -> std::result::Result<DeleteOutcome, RemoteError>;

    /// Whether any row has `field == value`. Used by the sequence allocator.
    async fn exists(
        &self,
        table: Table,
        field: &str,
        value: &Value,
    ) -> std::result::Result<bool, RemoteError>;

    /// Rows matching `filter`. Also used to probe that a table exists.
    async fn select(
        &self,
        table: Table,
        filter: &RemoteFilter,
    ) -> std::result::Result<Vec<RemoteRecord>, RemoteError>;
}

// ============================================================================
// Rows
// ============================================================================

/// A row as exchanged with the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub sequence_number: Option<i64>,
    pub body: RecordBody,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteRecord {
    /// Outbound row for a local record, sent under `id`.
    pub fn outbound(record: &Record, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence_number: record.sequence_number,
            body: record.body.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    pub fn table(&self) -> Table {
        self.body.table()
    }

    /// Value of a column, for `exists` lookups.
    pub fn field(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::String(self.id.clone())),
            "sequence_number" => self.sequence_number.map(Value::from),
            other => serde_json::to_value(&self.body)
                .ok()
                .and_then(|v| v.get(other).cloned()),
        }
    }
}

/// Result of a remote delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Filter for `RemoteStore::select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFilter {
    /// Only rows updated at or after this instant. Inclusive, because
    /// timestamps are not unique: a row committed later with the same
    /// timestamp as the cursor must still be returned.
    pub updated_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RemoteFilter {
    pub fn since(cursor: Option<DateTime<Utc>>) -> Self {
        Self {
            updated_since: cursor,
            limit: None,
        }
    }

    /// Zero-row select used to check the relation exists.
    pub fn probe() -> Self {
        Self {
            updated_since: None,
            limit: Some(0),
        }
    }
}

// ============================================================================
// RemoteError
// ============================================================================

/// Classification of remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Backend unreachable or timed out. Retried at the pass level.
    Transport,
    /// Table or relation does not exist.
    Schema,
    /// Row rejected (foreign key, uniqueness, required field).
    Constraint,
    /// Anything else the backend reports.
    Other,
}

/// Error returned by a `RemoteStore` implementation.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn with_kind(message: impl Into<String>, kind: RemoteErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::with_kind(message, RemoteErrorKind::Transport)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::with_kind(message, RemoteErrorKind::Schema)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::with_kind(message, RemoteErrorKind::Constraint)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}
