//! Order record types stored locally and shipped to the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Synchronization state of a local order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    UpdatePending,
    Synced,
    SyncFailed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::UpdatePending => "UPDATE_PENDING",
            Self::Synced => "SYNCED",
            Self::SyncFailed => "SYNC_FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::SyncFailed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "UPDATE_PENDING" => Ok(Self::UpdatePending),
            "SYNCED" => Ok(Self::Synced),
            "SYNC_FAILED" => Ok(Self::SyncFailed),
            other => Err(StoreError::InvalidValue {
                column: "sync_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "UNPAID",
            Self::Partial => "PARTIAL",
            Self::Paid => "PAID",
        }
    }

    /// Derive the status from what was paid against the order total. An
    /// order with nothing left to charge is `PAID`.
    pub fn from_amounts(total: f64, paid: f64) -> Self {
        if total <= 0.0 {
            Self::Paid
        } else if paid <= 0.0 {
            Self::Unpaid
        } else if paid + 0.005 < total {
            Self::Partial
        } else {
            Self::Paid
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNPAID" => Ok(Self::Unpaid),
            "PARTIAL" => Ok(Self::Partial),
            "PAID" => Ok(Self::Paid),
            other => Err(StoreError::InvalidValue {
                column: "payment_status",
                value: other.to_string(),
            }),
        }
    }
}

/// Where a job is on the shop floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductionStatus {
    Queue,
    Design,
    Printing,
    Finishing,
    Ready,
    Delivered,
}

impl ProductionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "QUEUE",
            Self::Design => "DESIGN",
            Self::Printing => "PRINTING",
            Self::Finishing => "FINISHING",
            Self::Ready => "READY",
            Self::Delivered => "DELIVERED",
        }
    }
}

impl FromStr for ProductionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUE" => Ok(Self::Queue),
            "DESIGN" => Ok(Self::Design),
            "PRINTING" => Ok(Self::Printing),
            "FINISHING" => Ok(Self::Finishing),
            "READY" => Ok(Self::Ready),
            "DELIVERED" => Ok(Self::Delivered),
            other => Err(StoreError::InvalidValue {
                column: "production_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub line_total: f64,
    /// Free-form job specification (paper, size, finishing, ...).
    #[serde(default)]
    pub specs: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub paid_amount: f64,
    pub remaining_amount: f64,
    pub status: PaymentStatus,
    pub method: Option<String>,
    pub received_by: Option<String>,
}

/// Audit trail of the last money movement on an order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialAction {
    pub action: Option<String>,
    pub by: Option<String>,
    pub at: Option<String>,
}

/// A local order with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: i64,
    pub uuid: Option<String>,
    pub server_id: Option<String>,
    pub server_order_number: Option<String>,

    pub sync_status: SyncStatus,
    pub sync_attempts: u32,
    pub last_sync_attempt_at: Option<String>,
    pub last_sync_error: Option<String>,

    pub customer: Customer,
    pub items: Vec<LineItem>,
    pub total_amount: f64,
    pub discount: f64,
    pub payment: Payment,
    pub production_status: ProductionStatus,
    pub is_tempo: bool,
    pub meta: Value,
    pub financial: FinancialAction,

    pub created_at: String,
    pub updated_at: String,
}

impl OrderRecord {
    /// Parsed `last_sync_attempt_at`. Unparseable timestamps count as never
    /// attempted so a corrupted value cannot freeze a record.
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_sync_attempt_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_roundtrip_strings() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::UpdatePending,
            SyncStatus::Synced,
            SyncStatus::SyncFailed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("synced".parse::<SyncStatus>().is_err());
        assert_eq!(
            serde_json::to_value(SyncStatus::UpdatePending).unwrap(),
            serde_json::json!("UPDATE_PENDING")
        );
    }

    #[test]
    fn test_payment_status_from_amounts() {
        assert_eq!(PaymentStatus::from_amounts(100.0, 0.0), PaymentStatus::Unpaid);
        assert_eq!(PaymentStatus::from_amounts(100.0, 40.0), PaymentStatus::Partial);
        assert_eq!(PaymentStatus::from_amounts(100.0, 100.0), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::from_amounts(100.0, 120.0), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::from_amounts(0.0, 0.0), PaymentStatus::Paid);
    }

    #[test]
    fn test_terminal_sync_states() {
        assert!(SyncStatus::Synced.is_terminal());
        assert!(SyncStatus::SyncFailed.is_terminal());
        assert!(!SyncStatus::Pending.is_terminal());
        assert!(!SyncStatus::UpdatePending.is_terminal());
    }

    #[test]
    fn test_production_status_parse_is_case_insensitive() {
        assert_eq!(
            " printing ".parse::<ProductionStatus>().unwrap(),
            ProductionStatus::Printing
        );
        assert!("lost".parse::<ProductionStatus>().is_err());
    }
}
