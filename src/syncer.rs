//! Syncer: wires the gateway, scheduler, orchestrator and reconciler together
//! and owns their background tasks.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SyncConfig,
    error::{AtelierError, Result},
    gateway::MutationGateway,
    remote::RemoteStore,
    storage::RecordStore,
    sync::{
        ConnectivityMonitor, DebounceScheduler, PassReport, ReconcileReport, Reconciler,
        SchedulerState, SyncOrchestrator,
    },
    types::SyncStatus,
};

struct Maintenance {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One engine instance. Nothing here is global; two syncers over two stores
/// run independently.
pub struct Syncer {
    config: SyncConfig,
    store: Arc<dyn RecordStore>,
    connectivity: ConnectivityMonitor,
    gateway: Arc<MutationGateway>,
    orchestrator: Arc<SyncOrchestrator>,
    reconciler: Arc<Reconciler>,
    scheduler: DebounceScheduler,
    maintenance: Mutex<Option<Maintenance>>,
}

impl Syncer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let scheduler = DebounceScheduler::new(&config);
        let gateway = Arc::new(MutationGateway::new(store.clone(), scheduler.trigger()));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            remote.clone(),
            connectivity.clone(),
            &config,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            remote,
            connectivity.clone(),
            gateway.clone(),
            &config,
        ));

        Ok(Self {
            config,
            store,
            connectivity,
            gateway,
            orchestrator,
            reconciler,
            scheduler,
            maintenance: Mutex::new(None),
        })
    }

    /// Start the scheduler and the periodic reconciler. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        self.scheduler
            .start(self.orchestrator.clone(), &self.connectivity);

        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return;
        }
        let Some(period) = self.config.reconcile_interval() else {
            tracing::debug!("periodic reconciliation disabled");
            return;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let reconciler = self.reconciler.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = reconciler.run().await {
                            tracing::error!(error = %e, "periodic reconciliation failed");
                        }
                    }
                }
            }
        });
        *maintenance = Some(Maintenance { cancel, handle });
        tracing::info!("syncer started");
    }

    pub async fn stop(&self) -> Result<()> {
        let maintenance = self.maintenance.lock().take();
        if let Some(Maintenance { cancel, handle }) = maintenance {
            cancel.cancel();
            handle
                .await
                .map_err(|e| AtelierError::Internal(format!("maintenance task failed: {e}")))?;
        }
        self.scheduler.stop().await?;
        tracing::info!("syncer stopped");
        Ok(())
    }

    pub fn gateway(&self) -> &Arc<MutationGateway> {
        &self.gateway
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &DebounceScheduler {
        &self.scheduler
    }

    /// Forward a platform `online`/`offline` event.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Run a pass now, queued behind any pass already in flight.
    pub async fn force_sync_now(&self) -> Result<PassReport> {
        self.scheduler.sync_now().await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.run().await
    }

    /// Per-table counts and the reasons of failed records.
    pub fn status(&self) -> Result<SyncStatus> {
        self.store.status()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }
}
