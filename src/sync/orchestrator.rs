//! One sync pass: push, purge and pull every table in dependency order.
//!
//! Parents are fully processed before their children so a child's foreign key
//! can be rewritten to an identifier the remote store already knows. Every
//! write back to the record store goes through `RecordStore::transact` and is
//! discarded when the record's revision moved on while the remote call was in
//! flight; the record then stays as the user left it and is pushed next pass.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    config::SyncConfig,
    remote::{
        DeleteOutcome, RemoteError, RemoteErrorKind, RemoteFilter, RemoteRecord, RemoteStore,
    },
    storage::{RecordStore, WriteOp},
    types::{FailureReason, Record, RecordFilter, SyncState, SyncStateKind, Table},
};

use super::{
    connectivity::ConnectivityMonitor,
    foreign_keys::{ForeignKeyResolver, Resolution},
    identifiers::{IdentifierService, ReserveError},
    scheduler::PassRunner,
    types::{PassReport, SyncErrorEvent, SyncErrorKind, SyncPhase},
};

/// Why the remainder of a table (or of the pass) is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    SkipTable,
    /// Connectivity dropped; nothing further is attempted this pass.
    Abort,
}

type Flow = std::result::Result<(), Stop>;

fn cursor_key(table: Table) -> String {
    format!("pull:{}", table.as_str())
}

// ============================================================================
// SyncOrchestrator
// ============================================================================

pub struct SyncOrchestrator {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    ids: Arc<IdentifierService>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            ids: Arc::new(IdentifierService::new(config.max_sequence_probes)),
        }
    }

    pub fn identifiers(&self) -> &IdentifierService {
        &self.ids
    }

    /// Run one full pass. Errors are collected into the report, never returned.
    pub async fn run_pass(&self) -> PassReport {
        if !self.connectivity.is_online() {
            tracing::debug!("offline; sync pass skipped");
            return PassReport::offline();
        }

        let mut report = PassReport::default();
        if let Err(e) = self.ids.rebuild(self.store.as_ref()) {
            tracing::error!(error = %e, "failed to rebuild identifier map");
            report.record_error(SyncErrorEvent::storage(
                SyncPhase::Push,
                Table::Customer,
                None,
                &e,
            ));
            return report;
        }

        for table in Table::ALL {
            match self.sync_table(table, &mut report).await {
                Ok(()) => {}
                Err(Stop::SkipTable) => report.skipped_tables.push(table),
                Err(Stop::Abort) => {
                    tracing::info!(%table, "connectivity lost; aborting sync pass");
                    report.aborted = true;
                    break;
                }
            }
        }

        tracing::info!(
            pushed = report.pushed,
            purged = report.purged,
            pulled = report.pulled,
            merged = report.merged,
            failed = report.failed,
            aborted = report.aborted,
            errors = report.errors.len(),
            "sync pass finished"
        );
        report
    }

    fn ensure_online(&self) -> Flow {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(Stop::Abort)
        }
    }

    async fn sync_table(&self, table: Table, report: &mut PassReport) -> Flow {
        self.ensure_online()?;
        if let Err(e) = self.remote.select(table, &RemoteFilter::probe()).await {
            report.record_error(SyncErrorEvent::remote(SyncPhase::Probe, table, None, &e));
            if e.kind == RemoteErrorKind::Schema {
                // The relation cannot hold any of our rows; tombstones are
                // still cleared so they do not linger.
                tracing::warn!(%table, error = %e, "remote table missing; skipping table");
                self.delete_table(table, report).await?;
            } else {
                tracing::warn!(%table, error = %e, "table probe failed; skipping table");
            }
            return Err(Stop::SkipTable);
        }

        self.push_table(table, report).await?;
        self.delete_table(table, report).await?;
        self.pull_table(table, report).await
    }

    // ------------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------------

    async fn push_table(&self, table: Table, report: &mut PassReport) -> Flow {
        let filter = RecordFilter::States(vec![SyncStateKind::Pending, SyncStateKind::Failed]);
        let mut candidates = match self.store.query(table, &filter) {
            // Orphans wait for the reconciler to re-link them.
            Ok(records) => records
                .into_iter()
                .filter(|r| {
                    !matches!(
                        r.sync_state,
                        SyncState::Failed(FailureReason::Orphaned { .. })
                    )
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                report.record_error(SyncErrorEvent::storage(SyncPhase::Push, table, None, &e));
                return Err(Stop::SkipTable);
            }
        };
        if candidates.is_empty() {
            return Ok(());
        }
        candidates.sort_by(|a, b| {
            (a.created_at, &a.local_id).cmp(&(b.created_at, &b.local_id))
        });

        if table.has_sequence_number() {
            match self.store.query(table, &RecordFilter::All) {
                Ok(all) => self.ids.load_claims(table, &all),
                Err(e) => {
                    report.record_error(SyncErrorEvent::storage(SyncPhase::Push, table, None, &e));
                    return Err(Stop::SkipTable);
                }
            }
        }

        tracing::debug!(%table, count = candidates.len(), "pushing records");
        for record in candidates {
            self.ensure_online()?;
            self.push_record(record, report).await?;
        }
        Ok(())
    }

    async fn push_record(&self, record: Record, report: &mut PassReport) -> Flow {
        let table = record.table();

        let resolver = ForeignKeyResolver::new(self.store.as_ref(), &self.ids);
        let resolved = match resolver.resolve(&record) {
            Ok(Resolution::Ready(resolved)) => resolved,
            Ok(Resolution::Blocked(reason)) => {
                self.fail_record(&record, reason, report);
                return Ok(());
            }
            Err(e) => {
                report.record_error(SyncErrorEvent::storage(
                    SyncPhase::Push,
                    table,
                    Some(&record.id),
                    &e,
                ));
                return Ok(());
            }
        };

        let mut outbound = resolved;
        let remote_id = match &outbound.remote_id {
            Some(remote_id) => remote_id.clone(),
            None if table.has_sequence_number() => {
                match self.prepare_sequenced(&record, &mut outbound, report).await? {
                    Some(outbound_id) => outbound_id,
                    None => return Ok(()),
                }
            }
            None => outbound.id.clone(),
        };

        self.ensure_online()?;
        let row = RemoteRecord::outbound(&outbound, remote_id);
        match self.remote.upsert(table, &row).await {
            Ok(committed) => {
                self.commit_push(&record, outbound, committed, report);
                Ok(())
            }
            Err(e) => self.push_failed(&record, e, report),
        }
    }

    /// Pick the identifier and sequence number a not-yet-committed record is
    /// sent with, and persist both before the upsert. A record whose earlier
    /// upsert landed without an acknowledgement is resent under the same
    /// identifier and number. `None` means the record was dealt with here.
    async fn prepare_sequenced(
        &self,
        record: &Record,
        outbound: &mut Record,
        report: &mut PassReport,
    ) -> std::result::Result<Option<String>, Stop> {
        let table = record.table();

        if let Some(outbound_id) = &record.outbound_id {
            self.ensure_online()?;
            let landed = self
                .remote
                .exists(table, "id", &Value::from(outbound_id.as_str()))
                .await;
            match landed {
                Ok(true) => {
                    tracing::debug!(
                        %table,
                        id = %record.id,
                        remote_id = %outbound_id,
                        "earlier push landed; resending"
                    );
                    return Ok(Some(outbound_id.clone()));
                }
                Ok(false) => {}
                Err(e) => return self.push_failed(record, e, report).map(|()| None),
            }
        }

        if let Some(start) = outbound.sequence_number {
            let reserved = self
                .ids
                .reserve(
                    self.remote.as_ref(),
                    &self.connectivity,
                    table,
                    outbound,
                    start,
                )
                .await;
            match reserved {
                Ok(reservation) => outbound.sequence_number = Some(reservation.sequence_number),
                Err(ReserveError::Offline) => return Err(Stop::Abort),
                Err(ReserveError::Exhausted { start, probes }) => {
                    let reason = FailureReason::SequenceExhausted { start, probes };
                    report.record_error(SyncErrorEvent::new(
                        SyncPhase::Push,
                        table,
                        Some(&record.id),
                        &reason,
                        SyncErrorKind::Identifier,
                    ));
                    self.fail_record(record, reason, report);
                    return Ok(None);
                }
                Err(ReserveError::Remote(e)) => {
                    return self.push_failed(record, e, report).map(|()| None);
                }
            }
        }

        let outbound_id = record
            .outbound_id
            .clone()
            .unwrap_or_else(IdentifierService::mint_remote_id);
        if !self.stage_outbound(record, &outbound_id, outbound.sequence_number, report) {
            return Ok(None);
        }
        Ok(Some(outbound_id))
    }

    /// Persist the outbound identifier and reserved number ahead of the upsert.
    fn stage_outbound(
        &self,
        record: &Record,
        outbound_id: &str,
        sequence_number: Option<i64>,
        report: &mut PassReport,
    ) -> bool {
        let table = record.table();
        let mut staged = false;
        let result = self.store.transact(table, &record.id, &mut |current| {
            let Some(mut current) = current.filter(|r| !r.is_tombstone()) else {
                return Ok(Vec::new());
            };
            current.outbound_id = Some(outbound_id.to_string());
            current.sequence_number = sequence_number;
            staged = true;
            Ok(vec![WriteOp::Put(current)])
        });

        match result {
            Ok(()) => staged,
            Err(e) => {
                report.record_error(SyncErrorEvent::storage(
                    SyncPhase::Push,
                    table,
                    Some(&record.id),
                    &e,
                ));
                false
            }
        }
    }

    /// Store the push result: remote id, reserved number, resolved body and,
    /// when the remote committed under another identifier, the new key.
    fn commit_push(
        &self,
        original: &Record,
        pushed: Record,
        committed: RemoteRecord,
        report: &mut PassReport,
    ) {
        let table = original.table();
        let mut stored: Option<Record> = None;

        let result = self.store.transact(table, &original.id, &mut |current| {
            let Some(mut current) = current else {
                return Ok(Vec::new());
            };
            current.remote_id = Some(committed.id.clone());
            current.outbound_id = None;
            current.sequence_number = pushed.sequence_number;
            if current.revision == original.revision {
                current.body = pushed.body.clone();
                current.sync_state = SyncState::Synced;
            }

            let mut ops = Vec::with_capacity(2);
            if current.id != committed.id {
                ops.push(WriteOp::Delete {
                    id: current.id.clone(),
                });
                current.id = committed.id.clone();
            }
            ops.push(WriteOp::Put(current.clone()));
            stored = Some(current);
            Ok(ops)
        });

        match (result, stored) {
            (Ok(()), Some(record)) => {
                self.ids
                    .record_mapping(table, &record.local_id, &committed.id);
                report.pushed += 1;
                if record.sync_state == SyncState::Synced {
                    tracing::debug!(
                        %table,
                        local_id = %record.local_id,
                        remote_id = %committed.id,
                        "record synced"
                    );
                } else {
                    tracing::debug!(
                        %table,
                        id = %record.id,
                        "record changed during push; left for next pass"
                    );
                }
            }
            (Ok(()), None) => {
                tracing::debug!(%table, id = %original.id, "record removed during push");
            }
            (Err(e), _) => {
                tracing::error!(
                    %table,
                    id = %original.id,
                    error = %e,
                    "failed to store push result"
                );
                report.record_error(SyncErrorEvent::storage(
                    SyncPhase::Push,
                    table,
                    Some(&original.id),
                    &e,
                ));
            }
        }
    }

    fn push_failed(&self, record: &Record, error: RemoteError, report: &mut PassReport) -> Flow {
        let table = record.table();
        report.record_error(SyncErrorEvent::remote(
            SyncPhase::Push,
            table,
            Some(&record.id),
            &error,
        ));

        match error.kind {
            RemoteErrorKind::Schema => {
                tracing::warn!(%table, error = %error, "remote table missing; skipping table");
                Err(Stop::SkipTable)
            }
            // Retried with the whole pass; the record keeps its state.
            RemoteErrorKind::Transport => {
                tracing::debug!(%table, id = %record.id, error = %error, "push interrupted");
                Ok(())
            }
            RemoteErrorKind::Constraint | RemoteErrorKind::Other => {
                let reason = FailureReason::Constraint {
                    message: error.message,
                };
                self.fail_record(record, reason, report);
                Ok(())
            }
        }
    }

    fn fail_record(&self, record: &Record, reason: FailureReason, report: &mut PassReport) {
        let table = record.table();
        let mut applied = false;

        let result = self.store.transact(table, &record.id, &mut |current| {
            match current {
                Some(mut current) if current.revision == record.revision => {
                    current.mark_failed(reason.clone());
                    applied = true;
                    Ok(vec![WriteOp::Put(current)])
                }
                _ => Ok(Vec::new()),
            }
        });

        match result {
            Ok(()) if applied => {
                tracing::warn!(%table, id = %record.id, reason = %reason, "record failed to sync");
                report.failed += 1;
            }
            Ok(()) => {}
            Err(e) => report.record_error(SyncErrorEvent::storage(
                SyncPhase::Push,
                table,
                Some(&record.id),
                &e,
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------------

    async fn delete_table(&self, table: Table, report: &mut PassReport) -> Flow {
        let tombstones = match self
            .store
            .query(table, &RecordFilter::State(SyncStateKind::Deleted))
        {
            Ok(records) => records,
            Err(e) => {
                report.record_error(SyncErrorEvent::storage(SyncPhase::Delete, table, None, &e));
                return Ok(());
            }
        };

        for record in tombstones {
            self.ensure_online()?;
            let confirmed = match self.remote.delete(table, record.remote_key()).await {
                Ok(DeleteOutcome::Deleted | DeleteOutcome::NotFound) => true,
                Err(e) if e.kind == RemoteErrorKind::Schema => true,
                Err(e) => {
                    tracing::warn!(
                        %table,
                        id = %record.id,
                        error = %e,
                        "remote delete failed; keeping tombstone"
                    );
                    report.record_error(SyncErrorEvent::remote(
                        SyncPhase::Delete,
                        table,
                        Some(&record.id),
                        &e,
                    ));
                    false
                }
            };
            if confirmed {
                self.purge(&record, report);
            }
        }
        Ok(())
    }

    fn purge(&self, record: &Record, report: &mut PassReport) {
        let table = record.table();
        let mut purged = false;

        let result = self.store.transact(table, &record.id, &mut |current| match current {
            Some(current) if current.is_tombstone() => {
                purged = true;
                Ok(vec![WriteOp::Delete { id: current.id }])
            }
            _ => Ok(Vec::new()),
        });

        match result {
            Ok(()) if purged => {
                tracing::debug!(%table, id = %record.id, "tombstone purged");
                report.purged += 1;
            }
            Ok(()) => {}
            Err(e) => report.record_error(SyncErrorEvent::storage(
                SyncPhase::Delete,
                table,
                Some(&record.id),
                &e,
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------------

    async fn pull_table(&self, table: Table, report: &mut PassReport) -> Flow {
        let key = cursor_key(table);
        let cursor = match self.store.get_meta(&key) {
            Ok(value) => value
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|t| t.with_timezone(&Utc)),
            Err(e) => {
                report.record_error(SyncErrorEvent::storage(SyncPhase::Pull, table, None, &e));
                return Ok(());
            }
        };

        self.ensure_online()?;
        let rows = match self.remote.select(table, &RemoteFilter::since(cursor)).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(%table, error = %e, "pull failed");
                report.record_error(SyncErrorEvent::remote(SyncPhase::Pull, table, None, &e));
                return Ok(());
            }
        };
        if rows.is_empty() {
            return Ok(());
        }

        // Rows at the cursor's own timestamp come back every pass and merge
        // as unchanged.
        let mut newest = cursor;
        let mut complete = true;
        for row in rows {
            match self.merge_row(&row) {
                Ok(Merge::Inserted) => report.pulled += 1,
                Ok(Merge::Updated) => report.merged += 1,
                Ok(Merge::Unchanged | Merge::LocalWins) => {}
                Err(e) => {
                    complete = false;
                    report.record_error(SyncErrorEvent::storage(
                        SyncPhase::Pull,
                        table,
                        Some(&row.id),
                        &e,
                    ));
                    continue;
                }
            }
            newest = newest.max(Some(row.updated_at));
        }

        // A row that failed to merge must be seen again next pass.
        if complete {
            if let Some(newest) = newest.filter(|n| Some(*n) != cursor) {
                if let Err(e) = self.store.set_meta(&key, &newest.to_rfc3339()) {
                    report.record_error(SyncErrorEvent::storage(SyncPhase::Pull, table, None, &e));
                }
            }
        }
        Ok(())
    }

    fn merge_row(&self, row: &RemoteRecord) -> crate::error::Result<Merge> {
        let table = row.table();
        let Some(local) = self.store.find(table, &row.id)? else {
            let mut inserted = false;
            self.store.transact(table, &row.id, &mut |current| {
                if current.is_some() {
                    return Ok(Vec::new());
                }
                inserted = true;
                Ok(vec![WriteOp::Put(Record {
                    id: row.id.clone(),
                    local_id: row.id.clone(),
                    remote_id: Some(row.id.clone()),
                    outbound_id: None,
                    sequence_number: row.sequence_number,
                    sync_state: SyncState::Synced,
                    revision: 0,
                    body: row.body.clone(),
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })])
            })?;
            if inserted {
                tracing::debug!(%table, id = %row.id, "pulled remote record");
                return Ok(Merge::Inserted);
            }
            return Ok(Merge::Unchanged);
        };

        if local.sync_state != SyncState::Synced {
            return Ok(Merge::LocalWins);
        }
        if local.body == row.body && local.sequence_number == row.sequence_number {
            return Ok(Merge::Unchanged);
        }

        let mut updated = false;
        self.store.transact(table, &local.id, &mut |current| match current {
            Some(mut current) if current.sync_state == SyncState::Synced => {
                current.body = row.body.clone();
                current.sequence_number = row.sequence_number;
                current.updated_at = row.updated_at;
                updated = true;
                Ok(vec![WriteOp::Put(current)])
            }
            _ => Ok(Vec::new()),
        })?;
        Ok(if updated {
            tracing::debug!(%table, id = %local.id, "refreshed record from remote");
            Merge::Updated
        } else {
            Merge::LocalWins
        })
    }
}

enum Merge {
    Inserted,
    Updated,
    Unchanged,
    LocalWins,
}

#[async_trait]
impl PassRunner for SyncOrchestrator {
    async fn run_pass(&self) -> PassReport {
        SyncOrchestrator::run_pass(self).await
    }
}

// ============================================================================
// Tests
// ============================================================================
