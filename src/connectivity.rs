//! Network reachability monitor.
//!
//! Probes the backend on a fixed period and publishes the result on a
//! `watch` channel. Receivers only see a change when reachability flips, so
//! the sync engine can treat every change to `true` as "back online".

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::BackendClient;

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

#[async_trait]
impl ConnectivityProbe for BackendClient {
    async fn is_reachable(&self) -> bool {
        let result = self.check_connectivity().await;
        if let Some(err) = &result.error {
            debug!(error = %err, "Connectivity probe failed");
        }
        result.online
    }
}

/// Spawn the probe loop. The channel starts at `initial` and the first probe
/// runs immediately. The loop ends when `cancel` fires.
pub fn spawn_monitor(
    probe: Arc<dyn ConnectivityProbe>,
    period: Duration,
    initial: bool,
    cancel: CancellationToken,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(initial);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let online = tokio::select! {
                        _ = cancel.cancelled() => break,
                        online = probe.is_reachable() => online,
                    };
                    let flipped = tx.send_if_modified(|current| {
                        if *current == online {
                            false
                        } else {
                            *current = online;
                            true
                        }
                    });
                    if flipped {
                        if online {
                            info!("Backend reachable");
                        } else {
                            warn!("Backend unreachable");
                        }
                    }
                }
            }
        }
        debug!("Connectivity monitor stopped");
    });

    (rx, task)
}
