//! The local store interface required by the gateway and the sync engine.

use crate::{
    error::Result,
    types::{FailedRecord, Record, RecordFilter, SyncStatus, Table, TableStatus},
};

/// A write staged by a `transact` closure. Applied atomically with the others.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Record),
    Delete { id: String },
}

/// Read-modify-write body for `RecordStore::transact`.
///
/// Receives the current value of the record (or `None`) and returns the writes
/// to apply. Returning an error rolls the transaction back.
pub type TransactFn<'a> = dyn FnMut(Option<Record>) -> Result<Vec<WriteOp>> + 'a;

/// Keyed document storage, one collection per table.
///
/// Implementations must serialize writes per table: a `transact` call observes
/// no interleaved writes to the same table between its read and its commit.
pub trait RecordStore: Send + Sync {
    fn get(&self, table: Table, id: &str) -> Result<Option<Record>>;

    /// Records of `table` matching `filter`, ordered by id.
    fn query(&self, table: Table, filter: &RecordFilter) -> Result<Vec<Record>>;

    fn put(&self, record: &Record) -> Result<()>;

    /// Remove a record outright. Returns whether it existed.
    fn delete(&self, table: Table, id: &str) -> Result<bool>;

    /// Atomic read-modify-write of the record stored under `id`.
    fn transact(&self, table: Table, id: &str, f: &mut TransactFn<'_>) -> Result<()>;

    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Look a record up by storage key, local id or remote id.
    fn find(&self, table: Table, ident: &str) -> Result<Option<Record>> {
        if let Some(record) = self.get(table, ident)? {
            return Ok(Some(record));
        }
        Ok(self
            .query(table, &RecordFilter::All)?
            .into_iter()
            .find(|r| r.answers_to(ident)))
    }

    /// Aggregate per-table counts and failure reasons.
    fn status(&self) -> Result<SyncStatus> {
        let mut status = SyncStatus::default();
        for table in Table::ALL {
            let mut counts = TableStatus::default();
            for record in self.query(table, &RecordFilter::All)? {
                counts.count(&record.sync_state);
                if let Some(reason) = record.sync_state.failure() {
                    status.failures.push(FailedRecord {
                        table,
                        id: record.id.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
            status.tables.insert(table, counts);
        }
        Ok(status)
    }
}
