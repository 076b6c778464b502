//! Identifier reconciliation: sequence-number reservation and the transient
//! local → remote identifier map.
//!
//! Sequence numbers are reserved by linear probing: starting at the record's
//! local number, each candidate is checked against the numbers claimed by other
//! local records and then probed remotely with `exists`. The first free value
//! wins. Two devices probing the same value in the same window can still both
//! succeed; the duplicate reconciler collapses the result afterwards.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    error::Result,
    remote::{RemoteError, RemoteStore},
    storage::RecordStore,
    types::{Record, RecordFilter, Table},
};

use super::connectivity::ConnectivityMonitor;

const SEQUENCE_FIELD: &str = "sequence_number";

/// Why a reservation did not produce a number.
#[derive(Debug)]
pub enum ReserveError {
    /// Every probed value was taken.
    Exhausted { start: i64, probes: u32 },
    Remote(RemoteError),
    /// Connectivity dropped before a probe.
    Offline,
}

/// A successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub sequence_number: i64,
    /// Remote `exists` calls spent.
    pub probes: u32,
}

#[derive(Debug, Clone)]
struct Claim {
    local_id: String,
    committed: bool,
    created_at: DateTime<Utc>,
}

impl Claim {
    /// Committed claims win; otherwise the earliest-created record does.
    fn outranks(&self, other: &Claim) -> bool {
        (!self.committed, self.created_at, &self.local_id)
            < (!other.committed, other.created_at, &other.local_id)
    }
}

/// Mints remote identifiers and reserves sequence numbers.
///
/// All state here is transient: it can be rebuilt from the record store.
pub struct IdentifierService {
    max_probes: u32,
    /// (table, local id) → confirmed remote id
    mappings: Mutex<HashMap<(Table, String), String>>,
    /// table → (sequence number → local claimant)
    claims: Mutex<HashMap<Table, BTreeMap<i64, Claim>>>,
}

impl IdentifierService {
    pub fn new(max_probes: u32) -> Self {
        Self {
            max_probes: max_probes.max(1),
            mappings: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh opaque identifier for a row in a sequence-numbered table. Minted
    /// once per record and stored as its `outbound_id` before the first push.
    pub fn mint_remote_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // -----------------------------------------------------------------------
    // Local → remote mapping
    // -----------------------------------------------------------------------

    pub fn record_mapping(&self, table: Table, local_id: &str, remote_id: &str) {
        self.mappings
            .lock()
            .insert((table, local_id.to_string()), remote_id.to_string());
    }

    pub fn remote_id_for(&self, table: Table, local_id: &str) -> Option<String> {
        self.mappings
            .lock()
            .get(&(table, local_id.to_string()))
            .cloned()
    }

    /// Rebuild the mapping from every record that has a confirmed remote id.
    pub fn rebuild(&self, store: &dyn RecordStore) -> Result<()> {
        let mut mappings = HashMap::new();
        for table in Table::ALL {
            for record in store.query(table, &RecordFilter::All)? {
                if let Some(remote_id) = record.remote_id {
                    mappings.insert((table, record.local_id), remote_id);
                }
            }
        }
        *self.mappings.lock() = mappings;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sequence allocator
    // -----------------------------------------------------------------------

    /// Recompute which local record claims each sequence number of `table`.
    pub fn load_claims(&self, table: Table, records: &[Record]) {
        let mut claims: BTreeMap<i64, Claim> = BTreeMap::new();
        for record in records {
            let Some(seq) = record.sequence_number else {
                continue;
            };
            let claim = Claim {
                local_id: record.local_id.clone(),
                committed: record.remote_id.is_some(),
                created_at: record.created_at,
            };
            match claims.get(&seq) {
                Some(existing) if existing.outranks(&claim) => {}
                _ => {
                    claims.insert(seq, claim);
                }
            }
        }
        self.claims.lock().insert(table, claims);
    }

    fn claimed_by_other(&self, table: Table, seq: i64, owner: &str) -> bool {
        self.claims
            .lock()
            .get(&table)
            .and_then(|c| c.get(&seq))
            .is_some_and(|claim| claim.local_id != owner)
    }

    fn claim(&self, table: Table, seq: i64, owner: &Record) {
        let mut claims = self.claims.lock();
        let table_claims = claims.entry(table).or_default();
        table_claims.retain(|n, c| *n == seq || c.local_id != owner.local_id);
        table_claims.insert(
            seq,
            Claim {
                local_id: owner.local_id.clone(),
                committed: true,
                created_at: owner.created_at,
            },
        );
    }

    /// Reserve the first free sequence number at or above `start` for `owner`.
    pub async fn reserve(
        &self,
        remote: &dyn RemoteStore,
        connectivity: &ConnectivityMonitor,
        table: Table,
        owner: &Record,
        start: i64,
    ) -> std::result::Result<Reservation, ReserveError> {
        let mut candidate = start;
        let mut probes = 0u32;

        loop {
            if self.claimed_by_other(table, candidate, &owner.local_id) {
                tracing::debug!(%table, candidate, "sequence number held by another local record");
                candidate += 1;
                continue;
            }
            if probes >= self.max_probes {
                return Err(ReserveError::Exhausted { start, probes });
            }
            if !connectivity.is_online() {
                return Err(ReserveError::Offline);
            }

            probes += 1;
            let taken = remote
                .exists(table, SEQUENCE_FIELD, &Value::from(candidate))
                .await
                .map_err(ReserveError::Remote)?;

            if !taken {
                if candidate != start {
                    tracing::info!(
                        %table,
                        id = %owner.id,
                        from = start,
                        to = candidate,
                        "sequence number collided; reserved next free value"
                    );
                }
                self.claim(table, candidate, owner);
                return Ok(Reservation {
                    sequence_number: candidate,
                    probes,
                });
            }
            candidate += 1;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
