//! Order store queries used by the sync engine.
//!
//! The engine talks to the store through [`OrderStore`] so sweeps can be
//! exercised against the real SQLite schema or a scripted double. `DbState`
//! is the production implementation.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::DbState;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Customer, FinancialAction, LineItem, OrderRecord, Payment, PaymentStatus, ProductionStatus,
    SyncStatus,
};

/// Outcome of one sync attempt, written back atomically per record.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPatch {
    pub status: SyncStatus,
    pub attempts: u32,
    pub attempted_at: String,
    pub error: Option<String>,
    pub server_id: Option<String>,
    pub server_order_number: Option<String>,
    /// `updated_at` of the snapshot that was sent. A `SYNCED` patch against a
    /// row that changed since then lands as `UPDATE_PENDING` instead, so the
    /// newer local state still reaches the backend.
    pub snapshot_updated_at: String,
}

pub trait OrderStore: Send + Sync {
    /// Up to `limit` records in `PENDING` or `UPDATE_PENDING`.
    fn pending_batch(&self, limit: usize) -> StoreResult<Vec<OrderRecord>>;

    /// Persist an idempotency key for a record that has none. Returns the key
    /// now stored, which is the existing one if the record already had it.
    fn assign_uuid(&self, local_id: i64, uuid: &str) -> StoreResult<String>;

    fn apply(&self, local_id: i64, patch: &SyncPatch) -> StoreResult<()>;

    fn get(&self, local_id: i64) -> StoreResult<Option<OrderRecord>>;
}

pub(crate) const ORDER_COLUMNS: &str = "id, uuid, server_id, server_order_number,
    sync_status, sync_attempts, last_sync_attempt_at, last_sync_error,
    customer_name, customer_phone, total_amount, discount,
    paid_amount, remaining_amount, payment_status, payment_method, received_by,
    production_status, is_tempo, meta,
    last_financial_action, financial_action_by, financial_action_at,
    created_at, updated_at";

fn parse_column<T: std::str::FromStr<Err = StoreError>>(raw: String) -> StoreResult<T> {
    raw.parse()
}

fn row_to_record(row: &Row<'_>) -> StoreResult<OrderRecord> {
    let meta_raw: String = row.get(19)?;
    let attempts: i64 = row.get(5)?;
    Ok(OrderRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        server_id: row.get(2)?,
        server_order_number: row.get(3)?,
        sync_status: parse_column(row.get(4)?)?,
        sync_attempts: attempts.max(0) as u32,
        last_sync_attempt_at: row.get(6)?,
        last_sync_error: row.get(7)?,
        customer: Customer {
            name: row.get(8)?,
            phone: row.get(9)?,
        },
        items: Vec::new(),
        total_amount: row.get(10)?,
        discount: row.get(11)?,
        payment: Payment {
            paid_amount: row.get(12)?,
            remaining_amount: row.get(13)?,
            status: parse_column::<PaymentStatus>(row.get(14)?)?,
            method: row.get(15)?,
            received_by: row.get(16)?,
        },
        production_status: parse_column::<ProductionStatus>(row.get(17)?)?,
        is_tempo: row.get::<_, i64>(18)? != 0,
        meta: serde_json::from_str(&meta_raw)?,
        financial: FinancialAction {
            action: row.get(20)?,
            by: row.get(21)?,
            at: row.get(22)?,
        },
        created_at: row.get(23)?,
        updated_at: row.get(24)?,
    })
}

fn load_items(conn: &Connection, order_id: i64) -> StoreResult<Vec<LineItem>> {
    let mut stmt = conn.prepare(
        "SELECT product_name, quantity, unit_price, line_total, specs
         FROM order_items WHERE order_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![order_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut items = Vec::new();
    for row in rows {
        let (product_name, quantity, unit_price, line_total, specs) = row?;
        items.push(LineItem {
            product_name,
            quantity,
            unit_price,
            line_total,
            specs: serde_json::from_str(&specs)?,
        });
    }
    Ok(items)
}

/// Load every order matching `where_clause`, with line items attached.
pub(crate) fn query_orders(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> StoreResult<Vec<OrderRecord>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE {where_clause}");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(row_to_record(row)?);
    }
    for record in &mut records {
        record.items = load_items(conn, record.id)?;
    }
    Ok(records)
}

pub(crate) fn load_order(conn: &Connection, local_id: i64) -> StoreResult<Option<OrderRecord>> {
    Ok(query_orders(conn, "id = ?1", &[&local_id])?.into_iter().next())
}

impl OrderStore for DbState {
    fn pending_batch(&self, limit: usize) -> StoreResult<Vec<OrderRecord>> {
        let conn = self.conn.lock()?;
        // Never-attempted rows first, then the longest-waiting retry.
        query_orders(
            &conn,
            "sync_status IN ('PENDING', 'UPDATE_PENDING')
             ORDER BY last_sync_attempt_at IS NOT NULL, last_sync_attempt_at ASC, id ASC
             LIMIT ?1",
            &[&(limit as i64)],
        )
    }

    fn assign_uuid(&self, local_id: i64, uuid: &str) -> StoreResult<String> {
        let conn = self.conn.lock()?;
        conn.execute(
            "UPDATE orders SET uuid = ?1 WHERE id = ?2 AND uuid IS NULL",
            params![uuid, local_id],
        )?;
        conn.query_row(
            "SELECT uuid FROM orders WHERE id = ?1",
            params![local_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten()
        .ok_or(StoreError::OrderNotFound(local_id))
    }

    fn apply(&self, local_id: i64, patch: &SyncPatch) -> StoreResult<()> {
        let conn = self.conn.lock()?;
        let changed = conn.execute(
            "UPDATE orders SET
                sync_status = CASE
                    WHEN ?1 = 'SYNCED' AND updated_at <> ?7 THEN 'UPDATE_PENDING'
                    ELSE ?1
                END,
                sync_attempts = MAX(sync_attempts, ?2),
                last_sync_attempt_at = ?3,
                last_sync_error = ?4,
                server_id = COALESCE(?5, server_id),
                server_order_number = COALESCE(?6, server_order_number)
             WHERE id = ?8",
            params![
                patch.status.as_str(),
                patch.attempts,
                patch.attempted_at,
                patch.error,
                patch.server_id,
                patch.server_order_number,
                patch.snapshot_updated_at,
                local_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::OrderNotFound(local_id));
        }
        Ok(())
    }

    fn get(&self, local_id: i64) -> StoreResult<Option<OrderRecord>> {
        let conn = self.conn.lock()?;
        load_order(&conn, local_id)
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub counts: BTreeMap<String, i64>,
    pub total: i64,
    pub oldest_pending_created_at: Option<String>,
}

/// Counts per sync status plus the age of the oldest unsynced order.
pub fn sync_summary(db: &DbState) -> StoreResult<SyncSummary> {
    let conn = db.conn.lock()?;
    let mut summary = SyncSummary::default();
    for status in [
        SyncStatus::Pending,
        SyncStatus::UpdatePending,
        SyncStatus::Synced,
        SyncStatus::SyncFailed,
    ] {
        summary.counts.insert(status.as_str().to_string(), 0);
    }

    let mut stmt = conn.prepare("SELECT sync_status, COUNT(*) FROM orders GROUP BY sync_status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (status, count) = row?;
        summary.total += count;
        summary.counts.insert(status, count);
    }

    summary.oldest_pending_created_at = conn
        .query_row(
            "SELECT MIN(created_at) FROM orders
             WHERE sync_status IN ('PENDING', 'UPDATE_PENDING')",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    Ok(summary)
}

/// Records frozen in `SYNC_FAILED`, most recent attempt first.
pub fn failed_orders(db: &DbState, limit: usize) -> StoreResult<Vec<OrderRecord>> {
    let conn = db.conn.lock()?;
    query_orders(
        &conn,
        "sync_status = 'SYNC_FAILED' ORDER BY last_sync_attempt_at DESC, id DESC LIMIT ?1",
        &[&(limit as i64)],
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn insert_raw_order(db: &DbState, status: &str, last_attempt: Option<&str>) -> i64 {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO orders (customer_name, total_amount, remaining_amount, sync_status,
                                 last_sync_attempt_at, created_at, updated_at)
             VALUES ('Sari', 50000, 50000, ?1, ?2, '2026-03-01T08:00:00Z', '2026-03-01T08:00:00Z')",
            params![status, last_attempt],
        )
        .unwrap();
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO order_items (order_id, position, product_name, quantity, unit_price,
                                      line_total, specs)
             VALUES (?1, 0, 'Banner 3x1m', 2, 25000, 50000, '{\"material\":\"flexi\"}')",
            params![id],
        )
        .unwrap();
        id
    }

    fn patch(status: SyncStatus, attempts: u32, snapshot: &str) -> SyncPatch {
        SyncPatch {
            status,
            attempts,
            attempted_at: "2026-03-01T09:00:00Z".into(),
            error: None,
            server_id: None,
            server_order_number: None,
            snapshot_updated_at: snapshot.into(),
        }
    }

    #[test]
    fn test_pending_batch_filters_and_orders() {
        let db = db::open_in_memory().unwrap();
        let retried = insert_raw_order(&db, "PENDING", Some("2026-03-01T08:30:00Z"));
        let fresh = insert_raw_order(&db, "PENDING", None);
        let update = insert_raw_order(&db, "UPDATE_PENDING", Some("2026-03-01T08:10:00Z"));
        insert_raw_order(&db, "SYNCED", None);
        insert_raw_order(&db, "SYNC_FAILED", None);

        let batch = db.pending_batch(5).unwrap();
        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![fresh, update, retried]);

        let first = &batch[0];
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].specs["material"], "flexi");
        assert_eq!(first.payment.status, PaymentStatus::Unpaid);
    }

    #[test]
    fn test_pending_batch_respects_limit() {
        let db = db::open_in_memory().unwrap();
        for _ in 0..8 {
            insert_raw_order(&db, "PENDING", None);
        }
        assert_eq!(db.pending_batch(5).unwrap().len(), 5);
    }

    #[test]
    fn test_assign_uuid_keeps_existing_key() {
        let db = db::open_in_memory().unwrap();
        let id = insert_raw_order(&db, "PENDING", None);

        let first = db.assign_uuid(id, "key-1").unwrap();
        let second = db.assign_uuid(id, "key-2").unwrap();
        assert_eq!(first, "key-1");
        assert_eq!(second, "key-1");
        assert!(matches!(
            db.assign_uuid(9_999, "key-3"),
            Err(StoreError::OrderNotFound(9_999))
        ));
    }

    #[test]
    fn test_apply_never_decreases_attempts() {
        let db = db::open_in_memory().unwrap();
        let id = insert_raw_order(&db, "PENDING", None);

        db.apply(id, &patch(SyncStatus::Pending, 3, "2026-03-01T08:00:00Z"))
            .unwrap();
        db.apply(id, &patch(SyncStatus::Pending, 1, "2026-03-01T08:00:00Z"))
            .unwrap();
        assert_eq!(db.get(id).unwrap().unwrap().sync_attempts, 3);
    }

    #[test]
    fn test_apply_synced_after_concurrent_edit_requeues_update() {
        let db = db::open_in_memory().unwrap();
        let id = insert_raw_order(&db, "PENDING", None);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE orders SET updated_at = '2026-03-01T08:45:00Z' WHERE id = ?1",
                params![id],
            )
            .unwrap();
        }

        let mut p = patch(SyncStatus::Synced, 0, "2026-03-01T08:00:00Z");
        p.server_id = Some("srv-1".into());
        db.apply(id, &p).unwrap();

        let record = db.get(id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::UpdatePending);
        assert_eq!(record.server_id.as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_summary_and_failed_listing() {
        let db = db::open_in_memory().unwrap();
        insert_raw_order(&db, "PENDING", None);
        insert_raw_order(&db, "PENDING", None);
        let failed = insert_raw_order(&db, "SYNC_FAILED", Some("2026-03-01T08:59:00Z"));
        insert_raw_order(&db, "SYNCED", None);

        let summary = sync_summary(&db).unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.counts["PENDING"], 2);
        assert_eq!(summary.counts["UPDATE_PENDING"], 0);
        assert_eq!(summary.counts["SYNC_FAILED"], 1);
        assert_eq!(
            summary.oldest_pending_created_at.as_deref(),
            Some("2026-03-01T08:00:00Z")
        );

        let listed = failed_orders(&db, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, failed);
    }
}
