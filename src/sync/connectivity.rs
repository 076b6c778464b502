//! Connectivity state shared by the scheduler and the orchestrator.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Single observable online/offline signal.
///
/// The host feeds platform events in through `set_online`; the scheduler
/// subscribes to transitions and the orchestrator polls `is_online` before
/// every remote call.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(Self::state_for(online));
        Self { tx: Arc::new(tx) }
    }

    fn state_for(online: bool) -> Connectivity {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow() == Connectivity::Online
    }

    pub fn state(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Record a platform `online`/`offline` event. Repeated events are ignored.
    pub fn set_online(&self, online: bool) {
        let next = Self::state_for(online);
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::info!(state = ?next, "connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
