use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IdempotencyKey, OrderId, ProductId};
use domain::{LineItemDemand, OrderStatus};

use crate::Result;

/// Transaction boundary: the entry point for every reservation.
///
/// A store hands out one transaction per call. All reads that inform a stock
/// decision and all writes happen through that transaction, which is either
/// committed or rolled back as a unit. Dropping a transaction without
/// committing it rolls it back.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// The transaction type produced by [`ReservationStore::begin`].
    type Transaction: StoreTransaction + 'static;

    /// Opens a new transaction with the store's lock timeout applied.
    async fn begin(&self) -> Result<Self::Transaction>;

    /// Reads the last committed stock for a product without locking.
    ///
    /// For inspection only. A value read here must never be used to decide a
    /// decrement.
    async fn stock_level(&self, product_id: &ProductId) -> Result<Option<i64>>;

    /// Reads the last committed status of an order without locking.
    async fn order_status(&self, order_id: OrderId) -> Result<Option<OrderStatus>>;
}

/// Lockable access to per-product stock counters.
#[async_trait]
pub trait InventoryStore: Send {
    /// Locks the product row for the rest of the transaction and returns its
    /// stock, or `None` if the product does not exist.
    ///
    /// Blocks while another transaction holds the lock, up to the lock
    /// timeout. Locking a row this transaction already holds returns the
    /// transaction's own view without blocking.
    async fn lock_and_read(&mut self, product_id: &ProductId) -> Result<Option<i64>>;

    /// Decrements stock on a row locked by this transaction and returns the
    /// new stock.
    ///
    /// Fails with `LockNotHeld` if `lock_and_read` was not called first and
    /// with `StockUnderflow` if `quantity` exceeds the current stock.
    async fn decrement(&mut self, product_id: &ProductId, quantity: i64) -> Result<i64>;
}

/// Order collaborator surface used by the reservation core.
#[async_trait]
pub trait OrderRepository: Send {
    /// Locks the order row for the rest of the transaction and returns its
    /// status, or `None` if the order does not exist.
    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<OrderStatus>>;

    /// Returns the order's line items in their stored order.
    async fn get_items(&mut self, order_id: OrderId) -> Result<Vec<LineItemDemand>>;

    /// Writes the order status inside this transaction.
    async fn set_status(&mut self, order_id: OrderId, status: OrderStatus) -> Result<()>;
}

/// Outcome of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyClaim {
    /// The key is new; this transaction now owns it until commit or rollback.
    Claimed,

    /// A committed request already used this key.
    Completed(IdempotencyRecord),
}

/// A committed request recorded under an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    /// Canonical description of the request that claimed the key.
    pub fingerprint: serde_json::Value,

    /// The recorded result of that request.
    pub outcome: serde_json::Value,

    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Log of completed requests keyed by client-supplied idempotency keys.
#[async_trait]
pub trait IdempotencyLog: Send {
    /// Claims `key` for this transaction.
    ///
    /// Blocks while another in-flight transaction holds the same key. If that
    /// transaction commits, returns its record; if it rolls back, the claim
    /// succeeds here.
    async fn claim(
        &mut self,
        key: &IdempotencyKey,
        fingerprint: &serde_json::Value,
    ) -> Result<IdempotencyClaim>;

    /// Records the outcome for a key claimed by this transaction.
    async fn record(&mut self, key: &IdempotencyKey, outcome: &serde_json::Value) -> Result<()>;
}

/// A unit of work spanning stock rows, the order row and the idempotency log.
#[async_trait]
pub trait StoreTransaction: InventoryStore + OrderRepository + IdempotencyLog {
    /// Makes every staged write visible and releases all locks.
    async fn commit(self) -> Result<()>;

    /// Discards every staged write and releases all locks.
    async fn rollback(self) -> Result<()>;
}
