//! MutationGateway: the only write path for application data.
//!
//! Every mutation persists the record as `pending` (or `deleted`), bumps its
//! revision and arms the sync scheduler.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    error::{AtelierError, Result},
    storage::{RecordStore, WriteOp},
    sync::SyncTrigger,
    types::{Record, RecordBody, RecordFilter, SyncState, SyncStateKind, Table},
};

/// Produces fresh local identifiers.
pub type IdGenerator = dyn Fn() -> String + Send + Sync;

pub struct MutationGateway {
    store: Arc<dyn RecordStore>,
    trigger: SyncTrigger,
    id_generator: Arc<IdGenerator>,
    /// Serializes sequence-number assignment.
    sequence_lock: Mutex<()>,
}

impl MutationGateway {
    pub fn new(store: Arc<dyn RecordStore>, trigger: SyncTrigger) -> Self {
        Self {
            store,
            trigger,
            id_generator: Arc::new(|| uuid::Uuid::new_v4().to_string()),
            sequence_lock: Mutex::new(()),
        }
    }

    pub fn with_id_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.id_generator = Arc::new(generator);
        self
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn create(&self, body: RecordBody) -> Result<Record> {
        let table = body.table();
        let local_id = (self.id_generator)();
        body.validate()
            .map_err(|message| AtelierError::constraint(table, &local_id, message))?;

        let now = Utc::now();
        let mut record = Record {
            id: local_id.clone(),
            local_id,
            remote_id: None,
            outbound_id: None,
            sequence_number: None,
            sync_state: SyncState::Pending,
            revision: 1,
            body,
            created_at: now,
            updated_at: now,
        };

        if table.has_sequence_number() {
            let _guard = self.sequence_lock.lock();
            record.sequence_number = Some(self.next_sequence_number(table)?);
            self.store.put(&record)?;
        } else {
            self.store.put(&record)?;
        }

        tracing::debug!(%table, id = %record.id, seq = ?record.sequence_number, "record created");
        self.trigger.notify();
        Ok(record)
    }

    fn next_sequence_number(&self, table: Table) -> Result<i64> {
        let highest = self
            .store
            .query(table, &RecordFilter::All)?
            .iter()
            .filter_map(|r| r.sequence_number)
            .max()
            .unwrap_or(0);
        Ok(highest + 1)
    }

    /// Merge `patch` into the record's body (RFC 7396 semantics).
    pub fn update(&self, table: Table, id: &str, patch: &Value) -> Result<Record> {
        let record = self.live(table, id)?;
        let updated = self.rewrite(&record, |current| {
            current.body = current
                .body
                .merge_patch(patch)
                .map_err(|message| AtelierError::constraint(table, &current.id, message))?;
            current.sync_state = SyncState::Pending;
            Ok(())
        })?;

        tracing::debug!(%table, id = %updated.id, revision = updated.revision, "record updated");
        self.trigger.notify();
        Ok(updated)
    }

    /// Tombstone a record. Its children are left alone.
    pub fn delete(&self, table: Table, id: &str) -> Result<()> {
        let record = self.live(table, id)?;
        self.tombstone(&record)?;
        tracing::debug!(%table, id = %record.id, "record deleted");
        self.trigger.notify();
        Ok(())
    }

    /// Tombstone a record and every live descendant. Returns how many records
    /// were tombstoned.
    pub fn delete_cascade(&self, table: Table, id: &str) -> Result<usize> {
        let record = self.live(table, id)?;
        let mut count = 0;
        self.cascade(&record, &mut count)?;
        tracing::debug!(%table, id = %record.id, count, "record deleted with descendants");
        self.trigger.notify();
        Ok(count)
    }

    fn cascade(&self, record: &Record, count: &mut usize) -> Result<()> {
        for child_table in record.table().children() {
            for child in self.store.query(child_table, &RecordFilter::All)? {
                let linked = child
                    .body
                    .parent_ref()
                    .is_some_and(|parent| record.answers_to(parent));
                if linked && !child.is_tombstone() {
                    self.cascade(&child, count)?;
                }
            }
        }
        self.tombstone(record)?;
        *count += 1;
        Ok(())
    }

    fn tombstone(&self, record: &Record) -> Result<Record> {
        self.rewrite(record, |current| {
            current.sync_state = SyncState::Deleted;
            Ok(())
        })
    }

    /// Move every `failed` record of `table` back to `pending`.
    pub fn retry_failed(&self, table: Table) -> Result<usize> {
        let mut count = 0;
        for record in self
            .store
            .query(table, &RecordFilter::State(SyncStateKind::Failed))?
        {
            let mut reset = false;
            self.store.transact(table, &record.id, &mut |current| match current {
                Some(mut current) if current.sync_state.kind() == SyncStateKind::Failed => {
                    current.sync_state = SyncState::Pending;
                    current.revision += 1;
                    reset = true;
                    Ok(vec![WriteOp::Put(current)])
                }
                _ => Ok(Vec::new()),
            })?;
            if reset {
                count += 1;
            }
        }

        if count > 0 {
            tracing::info!(%table, count, "failed records queued for retry");
            self.trigger.notify();
        }
        Ok(count)
    }

    /// Move one `failed` record back to `pending`. Returns whether it was failed.
    pub fn requeue(&self, table: Table, id: &str) -> Result<bool> {
        let record = self.live(table, id)?;
        if record.sync_state.kind() != SyncStateKind::Failed {
            return Ok(false);
        }
        self.rewrite(&record, |current| {
            if current.sync_state.kind() == SyncStateKind::Failed {
                current.sync_state = SyncState::Pending;
            }
            Ok(())
        })?;
        tracing::debug!(%table, id = %record.id, "failed record queued for retry");
        self.trigger.notify();
        Ok(true)
    }

    /// Read-modify-write of a live record under its storage key.
    fn rewrite(
        &self,
        record: &Record,
        mut change: impl FnMut(&mut Record) -> Result<()>,
    ) -> Result<Record> {
        let table = record.table();
        let mut written = None;
        self.store.transact(table, &record.id, &mut |current| {
            let Some(mut current) = current.filter(|r| !r.is_tombstone()) else {
                return Err(AtelierError::not_found(table, &record.id));
            };
            change(&mut current)?;
            current.revision += 1;
            current.updated_at = Utc::now();
            written = Some(current.clone());
            Ok(vec![WriteOp::Put(current)])
        })?;
        written.ok_or_else(|| AtelierError::not_found(table, &record.id))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look a live record up by storage key, local id or remote id.
    pub fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        Ok(self.store.find(table, id)?.filter(|r| !r.is_tombstone()))
    }

    /// Live records of `table`, ordered by storage key.
    pub fn list(&self, table: Table) -> Result<Vec<Record>> {
        Ok(self
            .store
            .query(table, &RecordFilter::All)?
            .into_iter()
            .filter(|r| !r.is_tombstone())
            .collect())
    }

    fn live(&self, table: Table, id: &str) -> Result<Record> {
        self.get(table, id)?
            .ok_or_else(|| AtelierError::not_found(table, id))
    }
}

// ============================================================================
// Tests
// ============================================================================
