use common::{OrderId, ProductId};
use thiserror::Error;

/// Errors that can occur inside a storage transaction.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Waiting for a row lock exceeded the configured lock timeout.
    #[error("Lock timeout while waiting for {resource}")]
    LockTimeout { resource: String },

    /// The database aborted the transaction to break a lock cycle or a
    /// serialization conflict.
    #[error("Transaction aborted by deadlock or serialization failure")]
    Deadlock,

    /// The connection to the database was lost or could not be obtained.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The transaction could not be committed.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// `decrement` was called for a product whose row lock is not held by
    /// this transaction.
    #[error("Row lock not held for product {product_id}")]
    LockNotHeld { product_id: ProductId },

    /// `decrement` would drive stock below zero.
    #[error("Stock underflow for product {product_id}: stock {stock}, decrement {quantity}")]
    StockUnderflow {
        product_id: ProductId,
        stock: i64,
        quantity: i64,
    },

    /// A status write targeted an order that does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// Stored data or a store call argument violated the storage contract.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true if retrying the whole transaction may succeed.
    ///
    /// Contract violations and corrupt data are never transient. A database
    /// error is transient only for connection exceptions (class `08`),
    /// insufficient resources (class `53`) and operator intervention
    /// (`57P01`..`57P05`).
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::LockTimeout { .. }
            | StoreError::Deadlock
            | StoreError::Connection(_)
            | StoreError::CommitFailed(_) => true,
            StoreError::Database(err) => {
                sqlstate(err).is_some_and(|code| is_transient_sqlstate(&code))
            }
            _ => false,
        }
    }

    /// Classifies a driver error, naming the row being locked for lock timeouts.
    pub(crate) fn from_sqlx(err: sqlx::Error, resource: impl FnOnce() -> String) -> Self {
        match sqlstate(&err).as_deref() {
            // lock_not_available, raised when lock_timeout expires
            Some("55P03") => {
                return StoreError::LockTimeout {
                    resource: resource(),
                };
            }
            // deadlock_detected, serialization_failure
            Some("40P01") | Some("40001") => return StoreError::Deadlock,
            _ => {}
        }

        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || matches!(code, "57P01" | "57P02" | "57P03" | "57P04" | "57P05")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::from_sqlx(err, || "row".to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
