//! Cashier-side order operations.
//!
//! These set the entry states the sync engine consumes: a new order starts
//! `PENDING`; a mutation of an already-synced order moves it to
//! `UPDATE_PENDING`. A mutation of a still-`PENDING` order stays `PENDING`
//! because the pending insert ships the latest row anyway.

use chrono::{SecondsFormat, Utc};
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{OrderError, StoreError};
use crate::models::{OrderRecord, PaymentStatus, ProductionStatus, SyncStatus};
use crate::store::load_order;

#[derive(Debug, Clone, Deserialize)]
pub struct NewLineItem {
    pub product_name: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub specs: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub customer_name: String,
    #[serde(default)]
    pub customer_phone: Option<String>,
    pub items: Vec<NewLineItem>,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub paid_amount: f64,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub received_by: Option<String>,
    #[serde(default)]
    pub is_tempo: bool,
    #[serde(default)]
    pub meta: Option<Value>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn round_money(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn validate(order: &NewOrder) -> Result<(), OrderError> {
    if order.customer_name.trim().is_empty() {
        return Err(OrderError::Invalid("customer name is required".into()));
    }
    if order.items.is_empty() {
        return Err(OrderError::Invalid("order has no items".into()));
    }
    for item in &order.items {
        if item.product_name.trim().is_empty() {
            return Err(OrderError::Invalid("item without product name".into()));
        }
        if !(item.quantity > 0.0) || !item.quantity.is_finite() {
            return Err(OrderError::Invalid(format!(
                "quantity for {} must be positive",
                item.product_name
            )));
        }
        if item.unit_price < 0.0 || !item.unit_price.is_finite() {
            return Err(OrderError::Invalid(format!(
                "unit price for {} must be non-negative",
                item.product_name
            )));
        }
    }
    if !(order.discount >= 0.0 && order.discount.is_finite())
        || !(order.paid_amount >= 0.0 && order.paid_amount.is_finite())
    {
        return Err(OrderError::Invalid(
            "discount and paid amount must be non-negative".into(),
        ));
    }
    Ok(())
}

/// Insert a new order in `PENDING` with a fresh idempotency key.
pub fn create_local_order(db: &DbState, order: &NewOrder) -> Result<OrderRecord, OrderError> {
    validate(order)?;

    let line_totals: Vec<f64> = order
        .items
        .iter()
        .map(|i| round_money(i.quantity * i.unit_price))
        .collect();
    let gross: f64 = line_totals.iter().sum();
    let total = round_money((gross - order.discount).max(0.0));
    let paid = round_money(order.paid_amount);
    let remaining = round_money((total - paid).max(0.0));
    let payment_status = PaymentStatus::from_amounts(total, paid);
    let now = now_rfc3339();
    let uuid = Uuid::new_v4().to_string();
    let meta = order.meta.clone().unwrap_or_else(|| serde_json::json!({}));

    let mut conn = db.conn.lock().map_err(StoreError::from)?;
    let tx = conn.transaction().map_err(StoreError::from)?;
    tx.execute(
        "INSERT INTO orders (
             uuid, customer_name, customer_phone, total_amount, discount,
             paid_amount, remaining_amount, payment_status, payment_method, received_by,
             production_status, is_tempo, meta, sync_status, sync_attempts,
             last_financial_action, financial_action_by, financial_action_at,
             created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'QUEUE', ?11, ?12, 'PENDING', 0,
                   ?13, ?14, ?15, ?16, ?16)",
        params![
            uuid,
            order.customer_name.trim(),
            order.customer_phone.as_deref().map(str::trim),
            total,
            order.discount,
            paid,
            remaining,
            payment_status.as_str(),
            order.payment_method,
            order.received_by,
            order.is_tempo as i64,
            serde_json::to_string(&meta).map_err(StoreError::from)?,
            (paid > 0.0).then_some("DOWN_PAYMENT"),
            (paid > 0.0).then(|| order.received_by.clone()).flatten(),
            (paid > 0.0).then(|| now.clone()),
            now,
        ],
    )
    .map_err(StoreError::from)?;
    let order_id = tx.last_insert_rowid();

    for (position, (item, line_total)) in order.items.iter().zip(&line_totals).enumerate() {
        let specs = item.specs.clone().unwrap_or_else(|| serde_json::json!({}));
        tx.execute(
            "INSERT INTO order_items (order_id, position, product_name, quantity, unit_price,
                                      line_total, specs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                order_id,
                position as i64,
                item.product_name.trim(),
                item.quantity,
                item.unit_price,
                line_total,
                serde_json::to_string(&specs).map_err(StoreError::from)?,
            ],
        )
        .map_err(StoreError::from)?;
    }
    tx.commit().map_err(StoreError::from)?;

    info!(local_id = order_id, total, "Order created locally");
    load_order(&conn, order_id)?.ok_or(OrderError::Store(StoreError::OrderNotFound(order_id)))
}

/// Status the record moves to after a local mutation.
fn status_after_mutation(record: &OrderRecord) -> Result<SyncStatus, OrderError> {
    match record.sync_status {
        SyncStatus::SyncFailed => Err(OrderError::SyncFailed(record.id)),
        SyncStatus::Pending => Ok(SyncStatus::Pending),
        SyncStatus::UpdatePending | SyncStatus::Synced => Ok(SyncStatus::UpdatePending),
    }
}

/// Take a payment against an order.
pub fn record_payment(
    db: &DbState,
    local_id: i64,
    amount: f64,
    method: &str,
    received_by: &str,
) -> Result<OrderRecord, OrderError> {
    if !(amount > 0.0) || !amount.is_finite() {
        return Err(OrderError::Invalid("payment amount must be positive".into()));
    }

    let conn = db.conn.lock().map_err(StoreError::from)?;
    let record = load_order(&conn, local_id)?.ok_or(StoreError::OrderNotFound(local_id))?;
    let next_status = status_after_mutation(&record)?;

    let paid = round_money(record.payment.paid_amount + amount);
    let remaining = round_money((record.total_amount - paid).max(0.0));
    let payment_status = PaymentStatus::from_amounts(record.total_amount, paid);
    let action = if payment_status == PaymentStatus::Paid {
        "SETTLEMENT"
    } else {
        "INSTALLMENT"
    };
    let now = now_rfc3339();

    conn.execute(
        "UPDATE orders SET
            paid_amount = ?1,
            remaining_amount = ?2,
            payment_status = ?3,
            payment_method = ?4,
            received_by = ?5,
            last_financial_action = ?6,
            financial_action_by = ?5,
            financial_action_at = ?7,
            sync_status = ?8,
            updated_at = ?7
         WHERE id = ?9",
        params![
            paid,
            remaining,
            payment_status.as_str(),
            method,
            received_by,
            action,
            now,
            next_status.as_str(),
            local_id,
        ],
    )
    .map_err(StoreError::from)?;

    info!(local_id, amount, paid, remaining, "Payment recorded");
    load_order(&conn, local_id)?.ok_or(OrderError::Store(StoreError::OrderNotFound(local_id)))
}

/// Move an order along the production floor.
pub fn set_production_status(
    db: &DbState,
    local_id: i64,
    status: ProductionStatus,
) -> Result<OrderRecord, OrderError> {
    let conn = db.conn.lock().map_err(StoreError::from)?;
    let record = load_order(&conn, local_id)?.ok_or(StoreError::OrderNotFound(local_id))?;
    let next_status = status_after_mutation(&record)?;

    conn.execute(
        "UPDATE orders SET production_status = ?1, sync_status = ?2, updated_at = ?3
         WHERE id = ?4",
        params![status.as_str(), next_status.as_str(), now_rfc3339(), local_id],
    )
    .map_err(StoreError::from)?;

    info!(local_id, status = status.as_str(), "Production status changed");
    load_order(&conn, local_id)?.ok_or(OrderError::Store(StoreError::OrderNotFound(local_id)))
}

// ===========================================================================
// Tests
// ===========================================================================
