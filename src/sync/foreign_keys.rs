//! Foreign-key resolution: rewrite a child's parent reference to the parent's
//! remote identifier before the child is pushed.

use crate::{
    error::Result,
    storage::RecordStore,
    types::{FailureReason, Record},
};

use super::identifiers::IdentifierService;

/// Outcome of resolving a child's parent reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The record is ready to push; its reference points at a remote id.
    Ready(Record),
    /// The parent has no confirmed remote id yet.
    Blocked(FailureReason),
}

pub struct ForeignKeyResolver<'a> {
    store: &'a dyn RecordStore,
    ids: &'a IdentifierService,
}

impl<'a> ForeignKeyResolver<'a> {
    pub fn new(store: &'a dyn RecordStore, ids: &'a IdentifierService) -> Self {
        Self { store, ids }
    }

    pub fn resolve(&self, child: &Record) -> Result<Resolution> {
        let table = child.table();
        let (Some(parent_table), Some(parent_ref)) = (table.parent(), child.body.parent_ref())
        else {
            return Ok(Resolution::Ready(child.clone()));
        };

        let remote_id = match self.ids.remote_id_for(parent_table, parent_ref) {
            Some(remote_id) => Some(remote_id),
            None => self
                .store
                .find(parent_table, parent_ref)?
                .and_then(|parent| parent.remote_id),
        };

        let Some(remote_id) = remote_id else {
            tracing::debug!(
                %table,
                id = %child.id,
                parent = %parent_table,
                parent_ref,
                "parent has no remote identifier yet"
            );
            return Ok(Resolution::Blocked(FailureReason::ParentUnavailable {
                parent: parent_table,
            }));
        };

        let mut resolved = child.clone();
        if remote_id != parent_ref {
            resolved.body.set_parent_ref(remote_id);
        }
        Ok(Resolution::Ready(resolved))
    }
}
