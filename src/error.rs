//! Error types for the record store, the mutation gateway and the sync engine.
//!
//! Errors inside a sync pass are recovered at the narrowest scope and reported
//! as `SyncErrorEvent`s; only caller-facing operations return `AtelierError`.

use thiserror::Error;

use crate::types::Table;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AtelierError>;

// ============================================================================
// StorageError
// ============================================================================

/// Failures raised by a `RecordStore` implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transaction failed: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("failed to (de)serialize record {table}/{id}: {source}")]
    Serialization {
        table: Table,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

// ============================================================================
// AtelierError
// ============================================================================

#[derive(Debug, Error)]
pub enum AtelierError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("record {table}/{id} not found")]
    NotFound { table: Table, id: String },

    #[error("record {table}/{id} is invalid: {message}")]
    Constraint {
        table: Table,
        id: String,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sync engine is not running")]
    NotRunning,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AtelierError {
    pub fn not_found(table: Table, id: impl Into<String>) -> Self {
        Self::NotFound {
            table,
            id: id.into(),
        }
    }

    pub fn constraint(table: Table, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            table,
            id: id.into(),
            message: message.into(),
        }
    }
}
