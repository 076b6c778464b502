//! atelier-sync: an offline-first record store for a tailoring shop's customers,
//! orders, order items and measurement sets, kept in step with a remote
//! relational backend.
//!
//! All writes go through the [`MutationGateway`] and land locally first. A
//! [`DebounceScheduler`] coalesces them into single-flight passes run by the
//! [`SyncOrchestrator`], which pushes parents before children, reserves
//! sequence numbers, purges confirmed tombstones and pulls remote changes.
//! The [`Reconciler`] repairs orphans and collapses duplicates. The [`Syncer`]
//! wires the pieces together.

pub mod config;
pub mod error;
pub mod gateway;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod syncer;
pub mod types;

pub use config::SyncConfig;
pub use error::{AtelierError, Result, StorageError};
pub use gateway::MutationGateway;
pub use remote::{
    DeleteOutcome, MemoryRemote, RemoteError, RemoteErrorKind, RemoteRecord, RemoteStore,
};
pub use storage::{MemoryStore, RecordStore};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use sync::{
    ConnectivityMonitor, DebounceScheduler, PassReport, ReconcileReport, Reconciler,
    SchedulerState, SyncOrchestrator,
};
pub use syncer::Syncer;
pub use types::{
    Customer, FailureReason, MeasurementSet, Order, OrderItem, OrderStatus, Record, RecordBody,
    SyncState, SyncStatus, Table, TableStatus,
};
