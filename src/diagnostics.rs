//! Diagnostics helpers.
//!
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Status report**: store location, schema version and sync counts
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::StoreResult;
use crate::store::{self, SyncSummary};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "printshop-sync";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub git_sha: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
    pub rust_version: &'static str,
}

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> AboutInfo {
    AboutInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        git_sha: env!("BUILD_GIT_SHA"),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        rust_version: env!("CARGO_PKG_RUST_VERSION"),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub about: AboutInfo,
    pub db_path: String,
    pub db_size_bytes: u64,
    pub schema_version: i32,
    pub machine_id: Option<String>,
    pub sync: SyncSummary,
}

/// Collect the status report for the local store.
pub fn status_report(db: &DbState) -> StoreResult<StatusReport> {
    let (schema_version, machine_id) = {
        let conn = db.conn.lock()?;
        (
            db::schema_version(&conn),
            db::get_setting(&conn, "device", "machine_id"),
        )
    };
    let sync = store::sync_summary(db)?;
    let db_size_bytes = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(StatusReport {
        about: about_info(),
        db_path: db.db_path.to_string_lossy().to_string(),
        db_size_bytes,
        schema_version,
        machine_id,
        sync,
    })
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
