//! Integration tests for the sync engine against `MemoryStore` + `MemoryRemote`.

mod ordering;
mod reconciliation;
mod scenarios;
mod scheduling;
mod support;
