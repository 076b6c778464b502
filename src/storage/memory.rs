//! MemoryStore, a `RecordStore` that holds every table in memory.
//!
//! Each table sits behind its own `parking_lot::Mutex`, so a `transact` call
//! holds the table lock from read to commit. Writes staged by a transaction are
//! validated first and then applied together; an error leaves the table untouched.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::types::{Record, RecordFilter, Table};

use super::traits::{RecordStore, TransactFn, WriteOp};

type TableMap = BTreeMap<String, Record>;

/// In-memory record store. Used by tests and by hosts that persist elsewhere.
pub struct MemoryStore {
    /// table → (record id → record)
    tables: HashMap<Table, Mutex<TableMap>>,
    /// metadata key → value
    meta: Mutex<HashMap<String, String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Table::ALL
                .into_iter()
                .map(|t| (t, Mutex::new(BTreeMap::new())))
                .collect(),
            meta: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self, table: Table) -> &Mutex<TableMap> {
        // Every variant is inserted in `new`.
        &self.tables[&table]
    }
}

/// Reject writes that would land a record in another table's collection.
pub(crate) fn check_ops(table: Table, ops: &[WriteOp]) -> Result<()> {
    for op in ops {
        if let WriteOp::Put(record) = op {
            if record.table() != table {
                return Err(StorageError::Transaction {
                    message: format!(
                        "record {} belongs to {}, not {}",
                        record.id,
                        record.table(),
                        table
                    ),
                    source: None,
                }
                .into());
            }
        }
    }
    Ok(())
}

impl RecordStore for MemoryStore {
    fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        Ok(self.table(table).lock().get(id).cloned())
    }

    fn query(&self, table: Table, filter: &RecordFilter) -> Result<Vec<Record>> {
        Ok(self
            .table(table)
            .lock()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn put(&self, record: &Record) -> Result<()> {
        self.table(record.table())
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, table: Table, id: &str) -> Result<bool> {
        Ok(self.table(table).lock().remove(id).is_some())
    }

    fn transact(&self, table: Table, id: &str, f: &mut TransactFn<'_>) -> Result<()> {
        let mut records = self.table(table).lock();
        let current = records.get(id).cloned();

        let ops = f(current)?;
        check_ops(table, &ops)?;

        for op in ops {
            match op {
                WriteOp::Put(record) => {
                    records.insert(record.id.clone(), record);
                }
                WriteOp::Delete { id } => {
                    records.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.meta.lock().get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.meta.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
