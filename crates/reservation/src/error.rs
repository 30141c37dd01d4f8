//! Reservation error types.

use common::{IdempotencyKey, OrderId, ProductId};
use domain::{OrderStatus, ValidationError};
use stock_store::StoreError;
use thiserror::Error;

/// Errors that can occur during a reservation.
///
/// Every variant means the whole batch was rejected: no stock decrement and
/// no order status change from the call is visible.
#[derive(Debug, Error)]
pub enum ReservationError {
    /// The request was malformed. Detected before any row was locked.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A requested product does not exist.
    #[error("Product not found: {product_id}")]
    NotFound { product_id: ProductId },

    /// A requested quantity exceeds the available stock.
    #[error("Insufficient stock for product {product_id}: have {have}, need {need}")]
    InsufficientStock {
        product_id: ProductId,
        have: i64,
        need: i64,
    },

    /// The order does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The order is not in a status from which stock can be reserved.
    #[error("Order {order_id} cannot be reserved in {status} state")]
    StateConflict {
        order_id: OrderId,
        status: OrderStatus,
    },

    /// The idempotency key already belongs to a different request.
    #[error("Idempotency key {key} was already used for a different request")]
    IdempotencyKeyReused { key: IdempotencyKey },

    /// The transaction could not complete (lock timeout, deadlock, lost
    /// connection, failed commit, or a storage contract violation).
    #[error("Transaction failed: {0}")]
    TransactionFailure(#[from] StoreError),
}

/// Stable classification of a [`ReservationError`] for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientStock,
    StateConflict,
    TransactionFailure,
}

impl ErrorKind {
    /// Returns the machine-readable name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::TransactionFailure => "transaction_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ReservationError {
    /// Returns the stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReservationError::Validation(_) => ErrorKind::Validation,
            ReservationError::NotFound { .. } | ReservationError::OrderNotFound(_) => {
                ErrorKind::NotFound
            }
            ReservationError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            ReservationError::StateConflict { .. }
            | ReservationError::IdempotencyKeyReused { .. } => ErrorKind::StateConflict,
            ReservationError::TransactionFailure(_) => ErrorKind::TransactionFailure,
        }
    }

    /// Returns true if the same batch may succeed when retried.
    ///
    /// Business failures (missing product, shortfall, wrong order state) are
    /// never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReservationError::TransactionFailure(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ReservationError {
    fn from(err: serde_json::Error) -> Self {
        ReservationError::TransactionFailure(StoreError::Serialization(err))
    }
}

/// Convenience type alias for reservation results.
pub type Result<T> = std::result::Result<T, ReservationError>;
