//! Contract with the authoritative order backend.
//!
//! [`RemoteOrderService`] is what the sync engine consumes; the HTTP
//! implementation lives in `api`. Request/response shapes mirror the
//! backend's `create_offline_order` procedure and `orders` table.

use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;
use crate::models::{LineItem, OrderRecord};

/// Every offline insert is tagged with this source.
pub const OFFLINE_SOURCE: &str = "OFFLINE";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerPayload {
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentPayload {
    pub amount: f64,
    pub method: Option<String>,
    pub received_by: Option<String>,
}

/// Body of the remote create procedure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateOrderPayload {
    pub ref_local_id: i64,
    pub local_created_at: String,
    pub source: &'static str,
    pub idempotency_key: String,
    pub machine_id: String,
    pub is_tempo: bool,
    pub customer: CustomerPayload,
    pub payment: PaymentPayload,
    pub items: Vec<LineItem>,
    pub total_amount: f64,
    pub discount: f64,
    pub paid_amount: f64,
    pub remaining_amount: f64,
    pub payment_status: String,
    pub production_status: String,
    pub meta: Value,
}

impl CreateOrderPayload {
    /// Build the insert payload. `idempotency_key` must already be persisted
    /// locally for this record.
    pub fn from_record(record: &OrderRecord, idempotency_key: &str, machine_id: &str) -> Self {
        let mut meta = match &record.meta {
            Value::Object(map) => Value::Object(map.clone()),
            _ => serde_json::json!({}),
        };
        if let Some(action) = &record.financial.action {
            meta["last_financial_action"] = Value::String(action.clone());
        }

        Self {
            ref_local_id: record.id,
            local_created_at: record.created_at.clone(),
            source: OFFLINE_SOURCE,
            idempotency_key: idempotency_key.to_string(),
            machine_id: machine_id.to_string(),
            is_tempo: record.is_tempo,
            customer: CustomerPayload {
                name: record.customer.name.clone(),
                phone: record.customer.phone.clone(),
            },
            payment: PaymentPayload {
                amount: record.payment.paid_amount,
                method: record.payment.method.clone(),
                received_by: record.payment.received_by.clone(),
            },
            items: record.items.clone(),
            total_amount: record.total_amount,
            discount: record.discount,
            paid_amount: record.payment.paid_amount,
            remaining_amount: record.payment.remaining_amount,
            payment_status: record.payment.status.as_str().to_string(),
            production_status: record.production_status.as_str().to_string(),
            meta,
        }
    }
}

/// Keys arrive as text or as integer primary keys depending on the backend's
/// schema. Both are kept as text.
fn key_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_key<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    key_text(value).ok_or_else(|| de::Error::custom("expected a string or numeric key"))
}

fn deserialize_opt_key<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => key_text(value)
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected a string or numeric key")),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateOrderResponse {
    pub success: bool,
    #[serde(default, deserialize_with = "deserialize_opt_key")]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_key")]
    pub order_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Which remote row an update applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTarget {
    ServerId(String),
    /// The insert has no acknowledged server id; match on `ref_local_id`.
    LocalRef(i64),
}

impl UpdateTarget {
    pub fn for_record(record: &OrderRecord) -> Self {
        match record.server_id.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(id) => Self::ServerId(id.to_string()),
            None => Self::LocalRef(record.id),
        }
    }
}

/// Partial row update for an already-synced order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderUpdatePatch {
    pub production_status: String,
    pub payment_status: String,
    pub paid_amount: f64,
    pub remaining_amount: f64,
    pub payment_method: Option<String>,
    pub last_financial_action: Option<String>,
    pub financial_action_by: Option<String>,
    pub financial_action_at: Option<String>,
    pub updated_at: String,
}

impl OrderUpdatePatch {
    pub fn from_record(record: &OrderRecord, updated_at: String) -> Self {
        Self {
            production_status: record.production_status.as_str().to_string(),
            payment_status: record.payment.status.as_str().to_string(),
            paid_amount: record.payment.paid_amount,
            remaining_amount: record.payment.remaining_amount,
            payment_method: record.payment.method.clone(),
            last_financial_action: record.financial.action.clone(),
            financial_action_by: record.financial.by.clone(),
            financial_action_at: record.financial.at.clone(),
            updated_at,
        }
    }
}

/// A remote row located by its local reference.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteOrderRef {
    #[serde(deserialize_with = "deserialize_key")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_opt_key")]
    pub order_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[async_trait]
pub trait RemoteOrderService: Send + Sync {
    async fn create_order(
        &self,
        payload: &CreateOrderPayload,
    ) -> Result<CreateOrderResponse, RemoteError>;

    async fn update_order(
        &self,
        target: &UpdateTarget,
        patch: &OrderUpdatePatch,
    ) -> Result<(), RemoteError>;

    /// Find the row a previous insert of this record created, if any.
    async fn lookup_by_local_ref(
        &self,
        local_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<RemoteOrderRef>, RemoteError>;
}
