//! Debounce scheduler: coalesces bursts of mutations into single-flight passes.
//!
//! One tokio task owns the state machine (`idle → armed → running → idle`) and
//! receives commands over an unbounded mpsc channel. Passes run inside that
//! task, so a second pass can never start while one is in flight; commands
//! that arrive meanwhile queue up and are handled once it finishes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::SyncConfig,
    error::{AtelierError, Result},
};

use super::{
    connectivity::{Connectivity, ConnectivityMonitor},
    types::PassReport,
};

/// Something that can run one sync pass.
#[async_trait]
pub trait PassRunner: Send + Sync {
    async fn run_pass(&self) -> PassReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// The quiet-period timer is counting down.
    Armed,
    Running,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub passes: u64,
    pub failed_passes: u64,
    pub retries_scheduled: u64,
}

enum Command {
    Mutation,
    SyncNow(oneshot::Sender<PassReport>),
    Retry { generation: u64 },
}

// ============================================================================
// SyncTrigger
// ============================================================================

/// Handle the mutation gateway uses to arm the scheduler.
#[derive(Clone)]
pub struct SyncTrigger {
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl SyncTrigger {
    /// A trigger connected to nothing.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self) {
        if let Some(tx) = &self.tx {
            if tx.send(Command::Mutation).is_err() {
                tracing::trace!("scheduler channel closed; mutation not signalled");
            }
        }
    }
}

// ============================================================================
// DebounceScheduler
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Timing {
    debounce: Duration,
    retry_backoff: Duration,
    max_retries: u32,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::UnboundedReceiver<Command>>,
}

pub struct DebounceScheduler {
    timing: Timing,
    tx: mpsc::UnboundedSender<Command>,
    /// Parked here while the actor is stopped.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    state: Arc<watch::Sender<SchedulerState>>,
    last_report: Arc<watch::Sender<Option<PassReport>>>,
    stats: Arc<Mutex<SchedulerStats>>,
    running: Mutex<Option<Running>>,
}

impl DebounceScheduler {
    pub fn new(config: &SyncConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (last_report, _) = watch::channel(None);
        Self {
            timing: Timing {
                debounce: config.debounce(),
                retry_backoff: config.retry_backoff(),
                max_retries: config.max_retry_attempts,
            },
            tx,
            rx: Mutex::new(Some(rx)),
            state: Arc::new(state),
            last_report: Arc::new(last_report),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
            running: Mutex::new(None),
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        SyncTrigger {
            tx: Some(self.tx.clone()),
        }
    }

    /// Spawn the actor. Mutations signalled before this call are not lost.
    pub fn start(&self, runner: Arc<dyn PassRunner>, connectivity: &ConnectivityMonitor) {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::debug!("scheduler already running");
            return;
        }
        let Some(rx) = self.rx.lock().take() else {
            tracing::error!("scheduler channel unavailable; cannot start");
            return;
        };

        let cancel = CancellationToken::new();
        let actor = Actor {
            timing: self.timing,
            runner,
            connectivity: connectivity.subscribe(),
            connectivity_open: true,
            rx,
            tx: self.tx.clone(),
            state: self.state.clone(),
            last_report: self.last_report.clone(),
            stats: self.stats.clone(),
            cancel: cancel.clone(),
            deadline: None,
            dirty: false,
            retry: None,
            retry_generation: 0,
            retry_attempts: 0,
        };
        let handle = tokio::spawn(actor.run());
        *running = Some(Running { cancel, handle });
        tracing::debug!("scheduler started");
    }

    /// Stop the actor, abandoning any in-flight pass, and wait for it to exit.
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { cancel, handle }) = self.running.lock().take() else {
            return Ok(());
        };
        cancel.cancel();
        let rx = handle
            .await
            .map_err(|e| AtelierError::Internal(format!("scheduler task failed: {e}")))?;
        *self.rx.lock() = Some(rx);
        self.state.send_replace(SchedulerState::Idle);
        tracing::debug!("scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Run a pass now, bypassing the quiet period. Waits behind a running pass.
    pub async fn sync_now(&self) -> Result<PassReport> {
        if !self.is_running() {
            return Err(AtelierError::NotRunning);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::SyncNow(reply_tx))
            .map_err(|_| AtelierError::NotRunning)?;
        reply_rx.await.map_err(|_| AtelierError::NotRunning)
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report.borrow().clone()
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Option<PassReport>> {
        self.last_report.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock()
    }
}

// ============================================================================
// Actor
// ============================================================================

enum PassTrigger {
    Debounce,
    Manual,
    Reconnect,
    Retry,
}

impl PassTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            PassTrigger::Debounce => "debounce",
            PassTrigger::Manual => "manual",
            PassTrigger::Reconnect => "reconnect",
            PassTrigger::Retry => "retry",
        }
    }
}

struct Actor {
    timing: Timing,
    runner: Arc<dyn PassRunner>,
    connectivity: watch::Receiver<Connectivity>,
    connectivity_open: bool,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<SchedulerState>>,
    last_report: Arc<watch::Sender<Option<PassReport>>>,
    stats: Arc<Mutex<SchedulerStats>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    /// Mutations arrived while offline.
    dirty: bool,
    retry: Option<CancellationToken>,
    retry_generation: u64,
    retry_attempts: u32,
}

impl Actor {
    async fn run(mut self) -> mpsc::UnboundedReceiver<Command> {
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = timer => {
                    self.deadline = None;
                    if self.run_pass(PassTrigger::Debounce).await.is_none() {
                        break;
                    }
                }
                changed = self.connectivity.changed(), if self.connectivity_open => {
                    if changed.is_err() {
                        self.connectivity_open = false;
                        continue;
                    }
                    let online = *self.connectivity.borrow_and_update() == Connectivity::Online;
                    if !self.connectivity_changed(online).await {
                        break;
                    }
                }
            }
        }

        self.cancel_retry();
        self.rx
    }

    fn is_online(&self) -> bool {
        *self.connectivity.borrow() == Connectivity::Online
    }

    /// Returns `false` once the actor has been cancelled.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Mutation => {
                if self.is_online() {
                    self.deadline = Some(Instant::now() + self.timing.debounce);
                    if *self.state.borrow() != SchedulerState::Running {
                        self.state.send_replace(SchedulerState::Armed);
                    }
                } else {
                    self.dirty = true;
                }
                true
            }
            Command::SyncNow(reply) => match self.run_pass(PassTrigger::Manual).await {
                Some(report) => {
                    let _ = reply.send(report);
                    true
                }
                None => false,
            },
            Command::Retry { generation } => {
                if generation != self.retry_generation || self.retry.is_none() {
                    return true;
                }
                self.retry = None;
                if !self.is_online() {
                    tracing::debug!("offline; scheduled retry dropped");
                    return true;
                }
                self.run_pass(PassTrigger::Retry).await.is_some()
            }
        }
    }

    async fn connectivity_changed(&mut self, online: bool) -> bool {
        if online {
            tracing::info!(dirty = self.dirty, "back online; starting sync pass");
            return self.run_pass(PassTrigger::Reconnect).await.is_some();
        }

        if self.deadline.take().is_some() {
            self.dirty = true;
        }
        self.cancel_retry();
        self.state.send_replace(SchedulerState::Idle);
        tracing::debug!("offline; timers cancelled");
        true
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
    }

    /// Run one pass. `None` means the actor was cancelled mid-pass.
    async fn run_pass(&mut self, trigger: PassTrigger) -> Option<PassReport> {
        self.cancel_retry();
        self.deadline = None;
        self.dirty = false;
        if !matches!(trigger, PassTrigger::Retry) {
            self.retry_attempts = 0;
        }

        self.state.send_replace(SchedulerState::Running);
        tracing::debug!(trigger = trigger.as_str(), "sync pass starting");

        let runner = self.runner.clone();
        let report = tokio::select! {
            report = runner.run_pass() => report,
            _ = self.cancel.cancelled() => return None,
        };

        let failed = report.needs_retry();
        {
            let mut stats = self.stats.lock();
            stats.passes += 1;
            if failed {
                stats.failed_passes += 1;
            }
        }

        if !failed {
            self.retry_attempts = 0;
        } else if self.is_online() {
            self.schedule_retry();
        }

        self.last_report.send_replace(Some(report.clone()));
        self.state.send_replace(if self.deadline.is_some() {
            SchedulerState::Armed
        } else {
            SchedulerState::Idle
        });
        Some(report)
    }

    fn schedule_retry(&mut self) {
        if self.retry_attempts >= self.timing.max_retries {
            tracing::warn!(
                attempts = self.retry_attempts,
                "retry limit reached; waiting for the next trigger"
            );
            return;
        }
        self.retry_attempts += 1;
        self.retry_generation += 1;
        self.stats.lock().retries_scheduled += 1;

        let token = self.cancel.child_token();
        let generation = self.retry_generation;
        let tx = self.tx.clone();
        let delay = self.timing.retry_backoff;
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Command::Retry { generation });
                }
            }
        });
        self.retry = Some(token);
        tracing::info!(
            attempt = self.retry_attempts,
            delay_ms = delay.as_millis() as u64,
            "sync pass failed; retry scheduled"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
