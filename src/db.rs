//! Local SQLite database layer for the offline order store.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection state used by the order operations and the sync
//! engine.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{StoreError, StoreResult};

/// Shared handle to the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Open (or create) the database at `db_path`.
///
/// Creates the parent directory if needed, sets pragmas, and runs any
/// pending migrations. Unlike a cache, this file holds unsynced orders, so a
/// failed open is reported instead of deleting the file.
pub fn init(db_path: &Path) -> StoreResult<DbState> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| StoreError::Setup(format!("create data dir: {e}")))?;
    }

    info!("Opening database at {}", db_path.display());
    let conn = open_and_configure(db_path)?;
    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// In-memory database with the full schema. Used by tests and dry runs.
pub fn open_in_memory() -> StoreResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| StoreError::Setup(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }
    if current > 0 {
        warn!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");
    }

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: orders, line items and settings.
fn migrate_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY(setting_category, setting_key)
        );

        -- orders (one row per cashier order, tagged with its sync state)
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE,
            server_id TEXT,
            server_order_number TEXT,
            customer_name TEXT NOT NULL,
            customer_phone TEXT,
            total_amount REAL NOT NULL DEFAULT 0,
            discount REAL NOT NULL DEFAULT 0,
            paid_amount REAL NOT NULL DEFAULT 0,
            remaining_amount REAL NOT NULL DEFAULT 0,
            payment_status TEXT NOT NULL DEFAULT 'UNPAID',
            payment_method TEXT,
            received_by TEXT,
            production_status TEXT NOT NULL DEFAULT 'QUEUE',
            is_tempo INTEGER NOT NULL DEFAULT 0,
            meta TEXT NOT NULL DEFAULT '{}',
            sync_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK(sync_status IN ('PENDING','UPDATE_PENDING','SYNCED','SYNC_FAILED')),
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            last_sync_attempt_at TEXT,
            last_sync_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- order_items (line items, ordered by position)
        CREATE TABLE IF NOT EXISTS order_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            product_name TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_price REAL NOT NULL,
            line_total REAL NOT NULL,
            specs TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::Setup(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (orders, order_items, local_settings)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: financial-action audit columns and the sync sweep index.
fn migrate_v2(conn: &Connection) -> StoreResult<()> {
    for column in [
        "last_financial_action",
        "financial_action_by",
        "financial_action_at",
    ] {
        if !column_exists(conn, "orders", column)? {
            conn.execute_batch(&format!("ALTER TABLE orders ADD COLUMN {column} TEXT;"))
                .map_err(|e| StoreError::Setup(format!("migration v2 add {column}: {e}")))?;
        }
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_orders_sync_status
            ON orders(sync_status, last_sync_attempt_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        StoreError::Setup(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (financial audit columns + sync index)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// The machine id this store was first synced under.
///
/// The first call records `configured`; later calls return the stored value
/// so a store moved between terminals keeps tagging its orders the same way.
pub fn ensure_machine_id(conn: &Connection, configured: &str) -> StoreResult<String> {
    if let Some(existing) = get_setting(conn, "device", "machine_id").filter(|v| !v.is_empty()) {
        if existing != configured {
            warn!("Configured machine id {configured} differs from stored {existing}; keeping stored");
        }
        return Ok(existing);
    }
    set_setting(conn, "device", "machine_id", configured)?;
    Ok(configured.to_string())
}

pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

// ===========================================================================
// Tests
// ===========================================================================
