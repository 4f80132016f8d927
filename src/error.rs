//! Error types shared by the local store, the remote client and the sync engine.

use thiserror::Error;

/// Failure reported by (or while talking to) the remote order backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The backend already holds a row with this idempotency key.
    #[error("duplicate idempotency key: {0}")]
    DuplicateKey(String),

    #[error("remote order not found: {0}")]
    NotFound(String),

    #[error("remote call timed out after {0}s")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    /// The backend understood the request and refused it (validation or
    /// business rule).
    #[error("rejected by backend: {0}")]
    Rejected(String),

    #[error("backend authentication failed: {0}")]
    Auth(String),

    #[error("backend server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("rpc error: {0}")]
    Rpc(String),
}

impl RemoteError {
    /// Errors that will fail the same way on every retry.
    ///
    /// `DuplicateKey` is not permanent here: the insert path resolves it by
    /// self-heal before falling back to ordinary retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::NotFound(_) | Self::Auth(_)
        )
    }
}

/// Failure of the local SQLite order store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("invalid stored value for {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("database setup: {0}")]
    Setup(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cashier-side order operation failure.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid order: {0}")]
    Invalid(String),

    #[error("order {0} is in SYNC_FAILED and needs manual remediation")]
    SyncFailed(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RemoteError::Rejected("total mismatch".into()).is_permanent());
        assert!(RemoteError::NotFound("abc".into()).is_permanent());
        assert!(RemoteError::Auth("HTTP 401".into()).is_permanent());

        assert!(!RemoteError::Timeout(20).is_permanent());
        assert!(!RemoteError::Network("connection refused".into()).is_permanent());
        assert!(!RemoteError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_permanent());
        assert!(!RemoteError::Rpc("boom".into()).is_permanent());
        assert!(!RemoteError::DuplicateKey("k".into()).is_permanent());
    }

    #[test]
    fn test_timeout_message_mentions_timeout() {
        let msg = RemoteError::Timeout(20).to_string();
        assert!(msg.contains("timed out"));
    }
}
