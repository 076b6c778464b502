//! SqliteStore, a durable `RecordStore` on a single SQLite file.
//!
//! Records are stored as JSON documents keyed by `(tbl, id)`. The sync state
//! and sequence number are duplicated into columns so state queries stay in SQL.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{Result, StorageError};
use crate::types::{Record, RecordFilter, Table};

use super::memory::check_ops;
use super::traits::{RecordStore, TransactFn, WriteOp};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    tbl   TEXT NOT NULL,
    id    TEXT NOT NULL,
    state TEXT NOT NULL,
    seq   INTEGER,
    data  TEXT NOT NULL,
    PRIMARY KEY (tbl, id)
);
CREATE INDEX IF NOT EXISTS records_state ON records (tbl, state);
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(StorageError::from)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(StorageError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn encode(record: &Record) -> Result<String> {
    serde_json::to_string(record).map_err(|source| {
        StorageError::Serialization {
            table: record.table(),
            id: record.id.clone(),
            source,
        }
        .into()
    })
}

fn decode(table: Table, id: &str, data: &str) -> Result<Record> {
    serde_json::from_str(data).map_err(|source| {
        StorageError::Serialization {
            table,
            id: id.to_string(),
            source,
        }
        .into()
    })
}

fn upsert_row(conn: &Connection, record: &Record) -> Result<()> {
    let data = encode(record)?;
    conn.execute(
        "INSERT INTO records (tbl, id, state, seq, data) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (tbl, id) DO UPDATE SET state = ?3, seq = ?4, data = ?5",
        params![
            record.table().as_str(),
            record.id,
            record.sync_state.kind().as_str(),
            record.sequence_number,
            data
        ],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

fn select_one(conn: &Connection, table: Table, id: &str) -> Result<Option<Record>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM records WHERE tbl = ?1 AND id = ?2",
            params![table.as_str(), id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)?;
    data.map(|d| decode(table, id, &d)).transpose()
}

fn apply_ops(tx: &Transaction<'_>, table: Table, ops: Vec<WriteOp>) -> Result<()> {
    for op in ops {
        match op {
            WriteOp::Put(record) => upsert_row(tx, &record)?,
            WriteOp::Delete { id } => {
                tx.execute(
                    "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                    params![table.as_str(), id],
                )
                .map_err(StorageError::from)?;
            }
        }
    }
    Ok(())
}

impl RecordStore for SqliteStore {
    fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        select_one(&self.conn.lock(), table, id)
    }

    fn query(&self, table: Table, filter: &RecordFilter) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let rows: Vec<(String, String)> = match filter {
            RecordFilter::State(kind) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, data FROM records WHERE tbl = ?1 AND state = ?2 ORDER BY id",
                    )
                    .map_err(StorageError::from)?;
                let rows = stmt
                    .query_map(params![table.as_str(), kind.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .map_err(StorageError::from)?;
                rows.collect::<std::result::Result<_, _>>()
                    .map_err(StorageError::from)?
            }
            _ => {
                let mut stmt = conn
                    .prepare("SELECT id, data FROM records WHERE tbl = ?1 ORDER BY id")
                    .map_err(StorageError::from)?;
                let rows = stmt
                    .query_map(params![table.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(StorageError::from)?;
                rows.collect::<std::result::Result<_, _>>()
                    .map_err(StorageError::from)?
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            let record = decode(table, &id, &data)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn put(&self, record: &Record) -> Result<()> {
        upsert_row(&self.conn.lock(), record)
    }

    fn delete(&self, table: Table, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                params![table.as_str(), id],
            )
            .map_err(StorageError::from)?;
        Ok(changed > 0)
    }

    fn transact(&self, table: Table, id: &str, f: &mut TransactFn<'_>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StorageError::from)?;

        let current = select_one(&tx, table, id)?;
        let ops = f(current)?;
        check_ops(table, &ops)?;
        apply_ops(&tx, table, ops)?;

        tx.commit().map_err(StorageError::from)?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(StorageError::from)?;
        Ok(value)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = ?2",
                params![key, value],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
