//! Sync-specific result types: pass reports and collected error events.

use serde::Serialize;

use crate::error::AtelierError;
use crate::remote::{RemoteError, RemoteErrorKind};
use crate::types::Table;

// ============================================================================
// Error Events
// ============================================================================

/// Which phase of a pass an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Table existence probe.
    Probe,
    Push,
    Delete,
    Pull,
}

/// Classification of sync errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Remote unreachable; the pass is retried.
    Transport,
    /// Remote table missing; the table is skipped.
    Schema,
    /// Record rejected or unresolvable; the record is marked failed.
    Constraint,
    /// Sequence probe budget exhausted.
    Identifier,
    /// Local store failure.
    Storage,
}

impl From<RemoteErrorKind> for SyncErrorKind {
    fn from(kind: RemoteErrorKind) -> Self {
        match kind {
            RemoteErrorKind::Transport => SyncErrorKind::Transport,
            RemoteErrorKind::Schema => SyncErrorKind::Schema,
            RemoteErrorKind::Constraint | RemoteErrorKind::Other => SyncErrorKind::Constraint,
        }
    }
}

/// A sync error event. Collected in `PassReport.errors`, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub table: Table,
    pub id: Option<String>,
    pub error: String,
    pub kind: SyncErrorKind,
}

impl SyncErrorEvent {
    pub fn new(
        phase: SyncPhase,
        table: Table,
        id: Option<&str>,
        error: impl ToString,
        kind: SyncErrorKind,
    ) -> Self {
        Self {
            phase,
            table,
            id: id.map(str::to_string),
            error: error.to_string(),
            kind,
        }
    }

    pub fn remote(phase: SyncPhase, table: Table, id: Option<&str>, error: &RemoteError) -> Self {
        Self {
            phase,
            table,
            id: id.map(str::to_string),
            error: error.message.clone(),
            kind: error.kind.into(),
        }
    }

    pub fn storage(phase: SyncPhase, table: Table, id: Option<&str>, error: &AtelierError) -> Self {
        Self::new(phase, table, id, error, SyncErrorKind::Storage)
    }
}

// ============================================================================
// Pass Report
// ============================================================================

/// Aggregated result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Records acknowledged by the remote store.
    pub pushed: usize,
    /// Tombstones purged after remote confirmation.
    pub purged: usize,
    /// Remote rows inserted locally.
    pub pulled: usize,
    /// Local synced rows refreshed from newer remote rows.
    pub merged: usize,
    /// Records marked failed during this pass.
    pub failed: usize,
    pub skipped_tables: Vec<Table>,
    /// The pass did not start because the device was offline.
    pub offline: bool,
    /// Connectivity dropped mid-pass; the remainder was left untouched.
    pub aborted: bool,
    pub transport_errors: usize,
    pub storage_errors: usize,
    pub errors: Vec<SyncErrorEvent>,
}

impl PassReport {
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Default::default()
        }
    }

    /// Whether the pass counts as failed for the scheduler's delayed retry.
    pub fn needs_retry(&self) -> bool {
        self.aborted || self.transport_errors > 0 || self.storage_errors > 0
    }

    pub fn record_error(&mut self, event: SyncErrorEvent) {
        match event.kind {
            SyncErrorKind::Transport => self.transport_errors += 1,
            SyncErrorKind::Storage => self.storage_errors += 1,
            _ => {}
        }
        self.errors.push(event);
    }
}
