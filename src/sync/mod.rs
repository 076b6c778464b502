pub mod connectivity;
pub mod foreign_keys;
pub mod identifiers;
pub mod orchestrator;
pub mod reconciler;
pub mod scheduler;
pub mod types;

pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use foreign_keys::{ForeignKeyResolver, Resolution};
pub use identifiers::{IdentifierService, Reservation, ReserveError};
pub use orchestrator::SyncOrchestrator;
pub use reconciler::{normalize_phone, ReconcileReport, Reconciler};
pub use scheduler::{DebounceScheduler, PassRunner, SchedulerState, SchedulerStats, SyncTrigger};
pub use types::{PassReport, SyncErrorEvent, SyncErrorKind, SyncPhase};
