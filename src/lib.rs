//! Printshop POS offline order sync.
//!
//! Orders are written to a local SQLite store first and delivered to the
//! backend by [`sync::SyncEngine`] whenever the network allows. The binary in
//! `main.rs` wires the pieces together; everything here is usable as a
//! library.

pub mod api;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod orders;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::BackendClient;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::db::DbState;
use crate::sync::{EngineSnapshot, SyncEngine};

/// Install structured logging: console plus a daily rolling file in
/// `log_dir`. Keep the returned guard alive until exit; dropping it flushes
/// the file writer.
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,printshop_sync=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Everything a running service needs, built from [`Config`].
pub struct Service {
    pub config: Config,
    pub db: Arc<DbState>,
    pub client: Arc<BackendClient>,
    pub engine: Arc<SyncEngine>,
}

impl Service {
    /// Open the store and build the backend client and sync engine.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(db::init(&config.db_path)?);
        let machine_id = {
            let conn = db.conn.lock().map_err(|_| error::StoreError::LockPoisoned)?;
            db::ensure_machine_id(&conn, &config.machine_id)?
        };

        let client = Arc::new(BackendClient::new(
            &config.backend_url,
            &config.api_key,
            api::DEFAULT_TIMEOUT,
        )?);
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            client.clone(),
            Arc::new(SystemClock),
            machine_id,
        ));

        Ok(Self {
            config,
            db,
            client,
            engine,
        })
    }

    /// Start the connectivity monitor and the engine loop, then wait for
    /// `shutdown`. Returns the engine's final state once both have stopped.
    pub async fn run_until(&self, shutdown: CancellationToken) -> anyhow::Result<EngineSnapshot> {
        info!(
            backend = %self.client.base_url(),
            db = %self.config.db_path.display(),
            interval_ms = self.config.sync_interval_ms,
            "Starting printshop-sync v{}",
            env!("CARGO_PKG_VERSION")
        );

        let monitor_cancel = shutdown.child_token();
        let (online_rx, monitor) = connectivity::spawn_monitor(
            self.client.clone(),
            std::time::Duration::from_millis(self.config.probe_interval_ms),
            true,
            monitor_cancel.clone(),
        );
        self.engine.start(self.config.sync_interval_ms, online_rx);

        shutdown.cancelled().await;
        info!("Shutdown requested; stopping sync");

        self.engine.shutdown().await;
        monitor_cancel.cancel();
        monitor.await?;

        let last = self.engine.snapshot();
        info!(
            last_sweep_at = last.last_sweep_at.as_deref().unwrap_or("never"),
            online = last.online,
            "Sync engine stopped"
        );
        Ok(last)
    }
}
