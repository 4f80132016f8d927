//! Background sync engine for offline orders.
//!
//! Delivers locally created or mutated orders to the backend. One sweep reads
//! a bounded batch of `PENDING`/`UPDATE_PENDING` records, drops the ones still
//! cooling down from a failed attempt, and pushes the rest one at a time.
//! Sweeps never overlap: a trigger that arrives while a sweep runs is
//! dropped, not queued. A timer and the network back-online event both
//! trigger sweeps.

use chrono::SecondsFormat;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff;
use crate::clock::Clock;
use crate::error::{RemoteError, StoreResult};
use crate::models::{OrderRecord, SyncStatus};
use crate::remote::{CreateOrderPayload, OrderUpdatePatch, RemoteOrderService, UpdateTarget};
use crate::store::{OrderStore, SyncPatch};

/// Records read per sweep.
pub const BATCH_SIZE: usize = 5;
/// Failed attempts before a record is frozen in `SYNC_FAILED`.
pub const MAX_ATTEMPTS: u32 = 10;
/// Upper bound on a single remote update call.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_INTERVAL_MS: u64 = 60_000;

/// Counts for one completed sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub fetched: usize,
    pub ready: usize,
    pub synced: usize,
    pub healed: usize,
    pub retried: usize,
    pub failed: usize,
    pub store_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was already running.
    Skipped,
    /// The batch could not be read.
    Aborted { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Synced,
    Healed,
    Retry,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub running: bool,
    pub sweep_in_progress: bool,
    pub online: bool,
    pub last_sweep_at: Option<String>,
    pub last_report: Option<SweepReport>,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Clears the re-entrancy flag however the sweep ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    store: Arc<dyn OrderStore>,
    remote: Arc<dyn RemoteOrderService>,
    clock: Arc<dyn Clock>,
    machine_id: String,
    is_syncing: AtomicBool,
    online: AtomicBool,
    loop_handle: Mutex<Option<LoopHandle>>,
    last_sweep: Mutex<Option<(String, SweepReport)>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        remote: Arc<dyn RemoteOrderService>,
        clock: Arc<dyn Clock>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            machine_id: machine_id.into(),
            is_syncing: AtomicBool::new(false),
            online: AtomicBool::new(true),
            loop_handle: Mutex::new(None),
            last_sweep: Mutex::new(None),
        }
    }

    fn now_rfc3339(&self) -> String {
        self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Start the background loop: a sweep every `interval_ms` and one on every
    /// offline -> online transition of `network`. Timer sweeps are skipped
    /// while `network` reports offline. Calling `start` on a running engine
    /// is a no-op.
    pub fn start(self: &Arc<Self>, interval_ms: u64, mut network: watch::Receiver<bool>) {
        let Ok(mut handle) = self.loop_handle.lock() else {
            error!("Sync loop state poisoned; not starting");
            return;
        };
        if handle.is_some() {
            warn!("Sync loop already running");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = Arc::clone(self);
        let period = Duration::from_millis(interval_ms.max(1));
        self.online.store(*network.borrow(), Ordering::SeqCst);

        let task = tokio::spawn(async move {
            info!("Sync loop started (interval: {interval_ms}ms)");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut listening = true;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if engine.online.load(Ordering::SeqCst) {
                            engine.run_triggered("timer").await;
                            // Ticks that fell inside the sweep are dropped.
                            ticker.reset();
                        } else {
                            debug!("Network offline; skipping timed sweep");
                        }
                    }
                    changed = network.changed(), if listening => {
                        if changed.is_err() {
                            warn!("Network monitor closed; continuing on timer only");
                            listening = false;
                            continue;
                        }
                        let online = *network.borrow_and_update();
                        let was_online = engine.online.swap(online, Ordering::SeqCst);
                        if online && !was_online {
                            info!("Network restored; resuming queued sync");
                            engine.run_triggered("network").await;
                            ticker.reset();
                        } else if !online && was_online {
                            info!("Network offline; deferring remote sync");
                        }
                    }
                }
            }
            info!("Sync loop stopped");
        });

        *handle = Some(LoopHandle { cancel, task });
    }

    /// Stop future sweeps and detach the timer and network listener. A sweep
    /// already running completes; await the returned handle to wait for it.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let handle = self.loop_handle.lock().ok()?.take()?;
        handle.cancel.cancel();
        Some(handle.task)
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.stop() {
            if let Err(e) = task.await {
                warn!("Sync loop task ended abnormally: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.loop_handle
            .lock()
            .map(|h| h.is_some())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let last = self.last_sweep.lock().ok().and_then(|g| g.clone());
        EngineSnapshot {
            running: self.is_running(),
            sweep_in_progress: self.is_syncing.load(Ordering::SeqCst),
            online: self.online.load(Ordering::SeqCst),
            last_sweep_at: last.as_ref().map(|(at, _)| at.clone()),
            last_report: last.map(|(_, report)| report),
        }
    }

    async fn run_triggered(&self, trigger: &str) {
        match self.sync_now().await {
            SweepOutcome::Completed(report) => {
                if report.ready > 0 {
                    info!(
                        trigger,
                        synced = report.synced,
                        healed = report.healed,
                        retried = report.retried,
                        failed = report.failed,
                        "Sync sweep complete"
                    );
                }
            }
            SweepOutcome::Skipped => debug!(trigger, "Sweep already in progress"),
            SweepOutcome::Aborted { error } => warn!(trigger, "Sync sweep aborted: {error}"),
        }
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    /// Run one sweep now unless one is already in progress.
    pub async fn sync_now(&self) -> SweepOutcome {
        let Some(_guard) = SweepGuard::acquire(&self.is_syncing) else {
            return SweepOutcome::Skipped;
        };

        match self.sweep().await {
            Ok(report) => {
                if let Ok(mut last) = self.last_sweep.lock() {
                    *last = Some((self.now_rfc3339(), report.clone()));
                }
                SweepOutcome::Completed(report)
            }
            Err(e) => {
                error!("Sync sweep failed: {e}");
                SweepOutcome::Aborted {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn sweep(&self) -> StoreResult<SweepReport> {
        let batch = self.store.pending_batch(BATCH_SIZE)?;
        let now = self.clock.now();
        let mut report = SweepReport {
            fetched: batch.len(),
            ..SweepReport::default()
        };

        for record in batch {
            if record.sync_status.is_terminal() {
                continue;
            }
            if record.sync_attempts >= MAX_ATTEMPTS {
                match self.freeze_exhausted(&record) {
                    Ok(()) => report.failed += 1,
                    Err(e) => {
                        warn!(local_id = record.id, "Failed to freeze exhausted record: {e}");
                        report.store_errors += 1;
                    }
                }
                continue;
            }
            if !backoff::is_ready(record.last_attempt(), record.sync_attempts, record.id, now) {
                debug!(
                    local_id = record.id,
                    attempts = record.sync_attempts,
                    "Record still in backoff"
                );
                continue;
            }
            report.ready += 1;

            let local_id = record.id;
            let result = if record.sync_status == SyncStatus::UpdatePending {
                self.sync_update(record).await
            } else {
                self.sync_insert(record).await
            };

            match result {
                Ok(RecordOutcome::Synced) => report.synced += 1,
                Ok(RecordOutcome::Healed) => report.healed += 1,
                Ok(RecordOutcome::Retry) => report.retried += 1,
                Ok(RecordOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    warn!(local_id, "Could not record sync outcome: {e}");
                    report.store_errors += 1;
                }
            }
        }

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Per-record paths
    // -----------------------------------------------------------------------

    async fn sync_insert(&self, record: OrderRecord) -> StoreResult<RecordOutcome> {
        let key = match record.uuid.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) => k.to_string(),
            None => {
                let key = self
                    .store
                    .assign_uuid(record.id, &Uuid::new_v4().to_string())?;
                info!(local_id = record.id, "Assigned missing idempotency key");
                key
            }
        };

        let payload = CreateOrderPayload::from_record(&record, &key, &self.machine_id);
        let result = match self.remote.create_order(&payload).await {
            Ok(resp) if resp.success => match resp.order_id {
                Some(order_id) => Ok((order_id, resp.order_number)),
                None => Err(RemoteError::Rpc(
                    "create_order reported success without order_id".into(),
                )),
            },
            Ok(resp) => Err(RemoteError::Rejected(
                resp.message
                    .unwrap_or_else(|| "create_order returned success=false".into()),
            )),
            Err(e) => Err(e),
        };

        match result {
            Ok((server_id, order_number)) => {
                self.mark_synced(&record, Some(server_id), order_number)?;
                info!(local_id = record.id, "Order inserted remotely");
                Ok(RecordOutcome::Synced)
            }
            Err(RemoteError::DuplicateKey(detail)) => {
                match self.remote.lookup_by_local_ref(record.id, &key).await {
                    Ok(Some(existing)) => {
                        self.mark_synced(&record, Some(existing.id), existing.order_number)?;
                        info!(
                            local_id = record.id,
                            "Duplicate key resolved by relinking existing remote order"
                        );
                        Ok(RecordOutcome::Healed)
                    }
                    Ok(None) => self.mark_failed(&record, &RemoteError::DuplicateKey(detail)),
                    Err(lookup_err) => {
                        warn!(local_id = record.id, "Self-heal lookup failed: {lookup_err}");
                        self.mark_failed(&record, &RemoteError::DuplicateKey(detail))
                    }
                }
            }
            Err(e) => self.mark_failed(&record, &e),
        }
    }

    async fn sync_update(&self, record: OrderRecord) -> StoreResult<RecordOutcome> {
        let target = UpdateTarget::for_record(&record);
        let patch = OrderUpdatePatch::from_record(&record, self.now_rfc3339());

        let result =
            match tokio::time::timeout(UPDATE_TIMEOUT, self.remote.update_order(&target, &patch))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(RemoteError::Timeout(UPDATE_TIMEOUT.as_secs())),
            };

        match result {
            Ok(()) => {
                self.mark_synced(&record, None, None)?;
                info!(local_id = record.id, "Order update pushed");
                Ok(RecordOutcome::Synced)
            }
            Err(e) => self.mark_failed(&record, &e),
        }
    }

    // -----------------------------------------------------------------------
    // Outcome recording
    // -----------------------------------------------------------------------

    fn mark_synced(
        &self,
        record: &OrderRecord,
        server_id: Option<String>,
        server_order_number: Option<String>,
    ) -> StoreResult<()> {
        self.store.apply(
            record.id,
            &SyncPatch {
                status: SyncStatus::Synced,
                attempts: record.sync_attempts,
                attempted_at: self.now_rfc3339(),
                error: None,
                server_id,
                server_order_number,
                snapshot_updated_at: record.updated_at.clone(),
            },
        )
    }

    fn mark_failed(&self, record: &OrderRecord, err: &RemoteError) -> StoreResult<RecordOutcome> {
        let attempts = record.sync_attempts.saturating_add(1);
        let give_up = err.is_permanent() || attempts >= MAX_ATTEMPTS;
        let status = if give_up {
            SyncStatus::SyncFailed
        } else {
            record.sync_status
        };

        self.store.apply(
            record.id,
            &SyncPatch {
                status,
                attempts,
                attempted_at: self.now_rfc3339(),
                error: Some(err.to_string()),
                server_id: None,
                server_order_number: None,
                snapshot_updated_at: record.updated_at.clone(),
            },
        )?;

        if give_up {
            warn!(
                local_id = record.id,
                attempts,
                permanent = err.is_permanent(),
                error = %err,
                "Giving up on order sync"
            );
            Ok(RecordOutcome::Failed)
        } else {
            debug!(
                local_id = record.id,
                attempts,
                error = %err,
                "Order sync failed; will retry"
            );
            Ok(RecordOutcome::Retry)
        }
    }

    fn freeze_exhausted(&self, record: &OrderRecord) -> StoreResult<()> {
        self.store.apply(
            record.id,
            &SyncPatch {
                status: SyncStatus::SyncFailed,
                attempts: record.sync_attempts,
                attempted_at: record
                    .last_sync_attempt_at
                    .clone()
                    .unwrap_or_else(|| self.now_rfc3339()),
                error: record
                    .last_sync_error
                    .clone()
                    .or_else(|| Some("attempt limit reached".into())),
                server_id: None,
                server_order_number: None,
                snapshot_updated_at: record.updated_at.clone(),
            },
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
