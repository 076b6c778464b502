//! Orphan and duplicate repair, run on demand or on a timer, outside the pass.
//!
//! Orphans are children whose parent reference matches no parent known locally
//! or remotely. They are re-linked through a secondary attribute (a customer's
//! phone number, an order's sequence number) when one matches; orphaned orders
//! and measurement sets otherwise get a placeholder customer. Order items cannot
//! be given a synthesized order and are left `failed`.
//!
//! Duplicates are committed records that share a sequence number, which can
//! happen when two devices reserve the same value in the same window.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use serde_json::json;

use crate::{
    config::SyncConfig,
    error::Result,
    gateway::MutationGateway,
    remote::RemoteStore,
    storage::{RecordStore, WriteOp},
    types::{Customer, FailureReason, Record, RecordBody, RecordFilter, SyncState, Table},
};

use super::connectivity::ConnectivityMonitor;

/// Strip everything but digits so `+91 98450-12345` matches `919845012345`.
pub fn normalize_phone(phone: &str) -> String {
    static NON_DIGITS: OnceLock<Regex> = OnceLock::new();
    NON_DIGITS
        .get_or_init(|| Regex::new(r"\D+").expect("static pattern is valid"))
        .replace_all(phone, "")
        .into_owned()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub relinked: usize,
    pub placeholders_created: usize,
    /// Records left `failed` because no parent could be found or made.
    pub orphaned: usize,
    /// Previously orphaned records whose parent turned up, queued for push.
    pub recovered: usize,
    pub duplicates_removed: usize,
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    gateway: Arc<MutationGateway>,
    placeholder_name: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        gateway: Arc<MutationGateway>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            gateway,
            placeholder_name: config.placeholder_customer_name.clone(),
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if self.connectivity.is_online() {
            self.repair_orphans(&mut report).await?;
        } else {
            tracing::debug!("offline; orphan repair skipped");
        }
        self.collapse_duplicates(&mut report)?;

        tracing::info!(
            relinked = report.relinked,
            placeholders = report.placeholders_created,
            orphaned = report.orphaned,
            recovered = report.recovered,
            duplicates = report.duplicates_removed,
            "reconciliation finished"
        );
        Ok(report)
    }

    // ========================================================================
    // Orphans
    // ========================================================================

    async fn repair_orphans(&self, report: &mut ReconcileReport) -> Result<()> {
        // normalized phone → placeholder customer id, reused within one run
        let mut placeholders: HashMap<String, String> = HashMap::new();

        for table in Table::ALL {
            let Some(parent) = table.parent() else {
                continue;
            };
            for child in self.store.query(table, &RecordFilter::All)? {
                if child.is_tombstone() {
                    continue;
                }
                let Some(parent_ref) = child.body.parent_ref() else {
                    continue;
                };
                let orphaned = matches!(
                    child.sync_state,
                    SyncState::Failed(FailureReason::Orphaned { .. })
                );

                let parent_known = if self.store.find(parent, parent_ref)?.is_some() {
                    true
                } else {
                    if !self.connectivity.is_online() {
                        tracing::debug!("connectivity lost; orphan repair stopped");
                        return Ok(());
                    }
                    match self.remote.exists(parent, "id", &json!(parent_ref)).await {
                        Ok(known) => known,
                        Err(e) => {
                            tracing::warn!(
                                %table,
                                id = %child.id,
                                error = %e,
                                "could not confirm orphan; skipping"
                            );
                            continue;
                        }
                    }
                };

                if parent_known {
                    if orphaned && self.gateway.requeue(table, &child.id)? {
                        tracing::info!(
                            %table,
                            id = %child.id,
                            parent_ref,
                            "parent found for orphaned record"
                        );
                        report.recovered += 1;
                    }
                    continue;
                }
                if !orphaned {
                    tracing::warn!(%table, id = %child.id, parent_ref, "orphaned record found");
                }
                self.repair(&child, parent, &mut placeholders, report)?;
            }
        }
        Ok(())
    }

    fn repair(
        &self,
        child: &Record,
        parent: Table,
        placeholders: &mut HashMap<String, String>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let table = child.table();

        if let Some(target) = self.match_parent(child)? {
            self.relink(child, &target)?;
            report.relinked += 1;
            return Ok(());
        }

        if parent != Table::Customer {
            report.orphaned += 1;
            if child.sync_state.failure() != Some(&FailureReason::Orphaned { parent }) {
                self.mark_orphaned(child, parent)?;
            }
            return Ok(());
        }

        let phone = child.body.customer_phone().map(str::to_string);
        let key = phone.as_deref().map(normalize_phone).filter(|p| !p.is_empty());
        let existing = key.as_ref().and_then(|k| placeholders.get(k)).cloned();
        let customer_id = match existing {
            Some(id) => id,
            None => {
                let placeholder = self.gateway.create(RecordBody::Customer(Customer {
                    name: self.placeholder_name.clone(),
                    phone,
                    email: None,
                    address: None,
                    notes: Some(format!(
                        "created for orphaned {} {}",
                        table.label(),
                        child.local_id
                    )),
                }))?;
                tracing::warn!(
                    %table,
                    id = %child.id,
                    customer = %placeholder.id,
                    "created placeholder customer"
                );
                report.placeholders_created += 1;
                if let Some(key) = key {
                    placeholders.insert(key, placeholder.id.clone());
                }
                placeholder.id
            }
        };

        self.relink(child, &customer_id)?;
        report.relinked += 1;
        Ok(())
    }

    /// Find a live parent through the child's secondary attribute.
    fn match_parent(&self, child: &Record) -> Result<Option<String>> {
        let parent = match &child.body {
            RecordBody::OrderItem(item) => {
                let Some(number) = item.order_number else {
                    return Ok(None);
                };
                self.store
                    .query(Table::Order, &RecordFilter::SequenceNumber(number))?
                    .into_iter()
                    .find(|order| !order.is_tombstone())
            }
            body => {
                let Some(phone) = body.customer_phone().map(normalize_phone) else {
                    return Ok(None);
                };
                if phone.is_empty() {
                    return Ok(None);
                }
                self.store
                    .query(Table::Customer, &RecordFilter::All)?
                    .into_iter()
                    .filter(|c| !c.is_tombstone())
                    .find(|c| {
                        c.body.customer_phone().map(normalize_phone).as_deref()
                            == Some(phone.as_str())
                    })
            }
        };
        Ok(parent.map(|p| p.remote_id.unwrap_or(p.id)))
    }

    fn relink(&self, child: &Record, parent_id: &str) -> Result<()> {
        let table = child.table();
        let field = match table {
            Table::OrderItem => "order_id",
            _ => "customer_id",
        };
        let mut patch = serde_json::Map::new();
        patch.insert(field.to_string(), json!(parent_id));
        self.gateway
            .update(table, &child.id, &serde_json::Value::Object(patch))?;
        tracing::info!(%table, id = %child.id, parent = parent_id, "re-linked orphaned record");
        Ok(())
    }

    fn mark_orphaned(&self, child: &Record, parent: Table) -> Result<()> {
        let table = child.table();
        self.store.transact(table, &child.id, &mut |current| match current {
            Some(mut current) if !current.is_tombstone() => {
                current.mark_failed(FailureReason::Orphaned { parent });
                Ok(vec![WriteOp::Put(current)])
            }
            _ => Ok(Vec::new()),
        })?;
        tracing::warn!(%table, id = %child.id, "orphaned record left failed");
        Ok(())
    }

    // ========================================================================
    // Duplicates
    // ========================================================================

    fn collapse_duplicates(&self, report: &mut ReconcileReport) -> Result<()> {
        for table in Table::ALL.into_iter().filter(|t| t.has_sequence_number()) {
            let mut groups: BTreeMap<i64, Vec<Record>> = BTreeMap::new();
            for record in self.store.query(table, &RecordFilter::All)? {
                // Uncommitted records are renumbered by the allocator on push.
                if let (Some(seq), Some(_)) = (record.sequence_number, &record.remote_id) {
                    groups.entry(seq).or_default().push(record);
                }
            }

            for (seq, mut group) in groups {
                if group.len() < 2 {
                    continue;
                }
                group.sort_by(|a, b| {
                    let rank = |r: &Record| (r.sync_state.kind().keep_priority(), r.updated_at);
                    rank(b).cmp(&rank(a)).then_with(|| a.id.cmp(&b.id))
                });
                let keeper = &group[0];
                for loser in group.iter().skip(1).filter(|r| !r.is_tombstone()) {
                    let removed = self.gateway.delete_cascade(table, &loser.id)?;
                    tracing::warn!(
                        %table,
                        seq,
                        kept = %keeper.id,
                        removed = %loser.id,
                        cascade = removed,
                        "collapsed duplicate sequence number"
                    );
                    report.duplicates_removed += 1;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
