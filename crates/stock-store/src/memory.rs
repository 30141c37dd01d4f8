use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use common::{IdempotencyKey, OrderId, ProductId};
use domain::{LineItemDemand, OrderStatus};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    Result, StoreConfig, StoreError,
    store::{
        IdempotencyClaim, IdempotencyLog, IdempotencyRecord, InventoryStore, OrderRepository,
        ReservationStore, StoreTransaction,
    },
};

/// A row with an exclusive transaction lock and its last committed value.
///
/// The committed value sits behind its own short-lived synchronous `RwLock`
/// so that snapshot reads never wait for a transaction holding the row lock,
/// and so that writing a commit back never suspends halfway through.
struct Row<V> {
    lock: Arc<Mutex<()>>,
    committed: RwLock<V>,
}

impl<V> Row<V> {
    fn new(value: V) -> Arc<Self> {
        Arc::new(Self {
            lock: Arc::new(Mutex::new(())),
            committed: RwLock::new(value),
        })
    }
}

/// A row locked by a transaction, with the value it will commit.
struct LockedRow<V> {
    row: Arc<Row<V>>,
    staged: Option<V>,
    _guard: OwnedMutexGuard<()>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl<V: Clone> LockedRow<V> {
    fn current(&self) -> V {
        match &self.staged {
            Some(value) => value.clone(),
            None => read(&self.row.committed).clone(),
        }
    }

    fn write_back(&mut self) {
        if let Some(value) = self.staged.take() {
            *write(&self.row.committed) = value;
        }
    }
}

async fn lock_row<V>(
    row: Arc<Row<V>>,
    timeout: Duration,
    resource: impl FnOnce() -> String,
) -> Result<LockedRow<V>> {
    let started = Instant::now();
    let guard = match tokio::time::timeout(timeout, row.lock.clone().lock_owned()).await {
        Ok(guard) => guard,
        Err(_) => {
            metrics::counter!("store_lock_timeouts_total").increment(1);
            return Err(StoreError::LockTimeout {
                resource: resource(),
            });
        }
    };
    metrics::histogram!("store_lock_wait_seconds").record(started.elapsed().as_secs_f64());

    Ok(LockedRow {
        row,
        staged: None,
        _guard: guard,
    })
}

/// Row map of one table. Never held across an `.await`.
type Table<K, V> = RwLock<HashMap<K, Arc<Row<V>>>>;

fn find_row<K: Eq + Hash, V>(table: &Table<K, V>, key: &K) -> Option<Arc<Row<V>>> {
    read(table).get(key).cloned()
}

#[derive(Debug, Clone)]
struct OrderRow {
    status: OrderStatus,
    items: Vec<LineItemDemand>,
}

#[derive(Default)]
struct Tables {
    products: Table<ProductId, i64>,
    orders: Table<OrderId, OrderRow>,
    requests: Table<IdempotencyKey, Option<IdempotencyRecord>>,
}

/// In-memory reservation store.
///
/// Provides the same locking and atomicity guarantees as the PostgreSQL
/// implementation: exclusive per-row locks held until commit or rollback,
/// writes staged inside the transaction, and a bounded lock wait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Tables>,
    config: StoreConfig,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty in-memory store with the given settings.
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Returns the store settings.
    pub fn config(&self) -> StoreConfig {
        self.config
    }

    /// Seeds or overwrites the committed stock of a product.
    ///
    /// Waits for any transaction holding the row, like a catalog update would.
    pub async fn set_stock(&self, product_id: impl Into<ProductId>, stock: i64) -> Result<()> {
        let product_id = product_id.into();
        if stock < 0 {
            return Err(StoreError::InvalidData(format!(
                "stock for {product_id} must not be negative, got {stock}"
            )));
        }

        let existing = find_row(&self.tables.products, &product_id);
        match existing {
            Some(row) => {
                let mut locked = lock_row(row, self.config.lock_timeout, || {
                    format!("product {product_id}")
                })
                .await?;
                locked.staged = Some(stock);
                locked.write_back();
            }
            None => {
                write(&self.tables.products)
                    .entry(product_id)
                    .or_insert_with(|| Row::new(stock));
            }
        }
        Ok(())
    }

    /// Inserts or replaces an order with the given status and items.
    pub async fn insert_order(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        items: Vec<LineItemDemand>,
    ) -> Result<()> {
        let row = OrderRow { status, items };
        let existing = find_row(&self.tables.orders, &order_id);
        match existing {
            Some(existing) => {
                let mut locked = lock_row(existing, self.config.lock_timeout, || {
                    format!("order {order_id}")
                })
                .await?;
                locked.staged = Some(row);
                locked.write_back();
            }
            None => {
                write(&self.tables.orders).insert(order_id, Row::new(row));
            }
        }
        Ok(())
    }

    /// Makes the next commit on this store fail, as a lost connection would.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Returns the number of idempotency keys with a committed outcome.
    pub async fn recorded_request_count(&self) -> usize {
        read(&self.tables.requests)
            .values()
            .filter(|row| read(&row.committed).is_some())
            .count()
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            tables: self.tables.clone(),
            lock_timeout: self.config.lock_timeout,
            fail_next_commit: self.fail_next_commit.clone(),
            products: BTreeMap::new(),
            orders: HashMap::new(),
            requests: HashMap::new(),
        })
    }

    async fn stock_level(&self, product_id: &ProductId) -> Result<Option<i64>> {
        match find_row(&self.tables.products, product_id) {
            Some(row) => Ok(Some(*read(&row.committed))),
            None => Ok(None),
        }
    }

    async fn order_status(&self, order_id: OrderId) -> Result<Option<OrderStatus>> {
        match find_row(&self.tables.orders, &order_id) {
            Some(row) => Ok(Some(read(&row.committed).status)),
            None => Ok(None),
        }
    }
}

/// Transaction over an [`InMemoryStore`].
///
/// Writes are staged per locked row and applied on commit. Dropping the
/// transaction discards staged writes, releases every lock, and removes
/// idempotency rows it created that never received a committed record.
pub struct InMemoryTransaction {
    tables: Arc<Tables>,
    lock_timeout: Duration,
    fail_next_commit: Arc<AtomicBool>,
    products: BTreeMap<ProductId, LockedRow<i64>>,
    orders: HashMap<OrderId, LockedRow<OrderRow>>,
    requests: HashMap<IdempotencyKey, LockedRow<Option<IdempotencyRecord>>>,
}

impl InMemoryTransaction {
    /// Product ids currently locked by this transaction, in lock order.
    pub fn locked_products(&self) -> Vec<ProductId> {
        self.products.keys().cloned().collect()
    }

    async fn locked_order(&mut self, order_id: OrderId) -> Result<Option<&mut LockedRow<OrderRow>>> {
        if !self.orders.contains_key(&order_id) {
            let Some(row) = find_row(&self.tables.orders, &order_id) else {
                return Ok(None);
            };
            let locked = lock_row(row, self.lock_timeout, || format!("order {order_id}")).await?;
            self.orders.insert(order_id, locked);
        }
        Ok(self.orders.get_mut(&order_id))
    }
}

#[async_trait]
impl InventoryStore for InMemoryTransaction {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn lock_and_read(&mut self, product_id: &ProductId) -> Result<Option<i64>> {
        if let Some(locked) = self.products.get(product_id) {
            return Ok(Some(locked.current()));
        }

        let Some(row) = find_row(&self.tables.products, product_id) else {
            return Ok(None);
        };
        let locked = lock_row(row, self.lock_timeout, || format!("product {product_id}")).await?;
        let stock = locked.current();
        self.products.insert(product_id.clone(), locked);

        tracing::debug!(%product_id, stock, "product row locked");
        Ok(Some(stock))
    }

    async fn decrement(&mut self, product_id: &ProductId, quantity: i64) -> Result<i64> {
        if quantity <= 0 {
            return Err(StoreError::InvalidData(format!(
                "decrement for {product_id} must be positive, got {quantity}"
            )));
        }

        let locked = self
            .products
            .get_mut(product_id)
            .ok_or_else(|| StoreError::LockNotHeld {
                product_id: product_id.clone(),
            })?;

        let stock = locked.current();
        if quantity > stock {
            return Err(StoreError::StockUnderflow {
                product_id: product_id.clone(),
                stock,
                quantity,
            });
        }

        let remaining = stock - quantity;
        locked.staged = Some(remaining);
        Ok(remaining)
    }
}

#[async_trait]
impl OrderRepository for InMemoryTransaction {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<OrderStatus>> {
        match self.locked_order(order_id).await? {
            Some(locked) => Ok(Some(locked.current().status)),
            None => Ok(None),
        }
    }

    async fn get_items(&mut self, order_id: OrderId) -> Result<Vec<LineItemDemand>> {
        if let Some(locked) = self.orders.get(&order_id) {
            return Ok(locked.current().items);
        }
        match find_row(&self.tables.orders, &order_id) {
            Some(row) => Ok(read(&row.committed).items.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn set_status(&mut self, order_id: OrderId, status: OrderStatus) -> Result<()> {
        let locked = self
            .locked_order(order_id)
            .await?
            .ok_or(StoreError::OrderNotFound(order_id))?;

        let mut row = locked.current();
        row.status = status;
        locked.staged = Some(row);
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLog for InMemoryTransaction {
    async fn claim(
        &mut self,
        key: &IdempotencyKey,
        fingerprint: &serde_json::Value,
    ) -> Result<IdempotencyClaim> {
        if let Some(locked) = self.requests.get(key) {
            if locked.staged.is_some() {
                return Ok(IdempotencyClaim::Claimed);
            }
            return Ok(match locked.current() {
                Some(record) => IdempotencyClaim::Completed(record),
                None => IdempotencyClaim::Claimed,
            });
        }

        let row = write(&self.tables.requests)
            .entry(key.clone())
            .or_insert_with(|| Row::new(None))
            .clone();
        let mut locked = lock_row(row, self.lock_timeout, || format!("idempotency key {key}")).await?;

        let claim = match locked.current() {
            Some(record) => IdempotencyClaim::Completed(record),
            None => {
                locked.staged = Some(Some(IdempotencyRecord {
                    fingerprint: fingerprint.clone(),
                    outcome: serde_json::Value::Null,
                    recorded_at: Utc::now(),
                }));
                IdempotencyClaim::Claimed
            }
        };
        self.requests.insert(key.clone(), locked);
        Ok(claim)
    }

    async fn record(&mut self, key: &IdempotencyKey, outcome: &serde_json::Value) -> Result<()> {
        let locked = self.requests.get_mut(key).ok_or_else(|| {
            StoreError::InvalidData(format!("idempotency key {key} was not claimed"))
        })?;

        let Some(Some(mut record)) = locked.staged.take() else {
            return Err(StoreError::InvalidData(format!(
                "idempotency key {key} already has a committed outcome"
            )));
        };
        record.outcome = outcome.clone();
        record.recorded_at = Utc::now();
        locked.staged = Some(Some(record));
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(mut self) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::CommitFailed(
                "connection closed before commit".to_string(),
            ));
        }

        // No suspension point from here on: a cancelled commit either never
        // started or applied every write, and all writes land before any
        // row lock is released.
        for locked in self.requests.values_mut() {
            locked.write_back();
        }
        for locked in self.orders.values_mut() {
            locked.write_back();
        }
        for locked in self.products.values_mut() {
            locked.write_back();
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.requests.is_empty() {
            return;
        }

        // A claim inserts an empty row; drop it again unless it was committed
        // or another transaction is waiting on it.
        let mut table = write(&self.tables.requests);
        for (key, locked) in &self.requests {
            if read(&locked.row.committed).is_some() || Arc::strong_count(&locked.row) > 2 {
                continue;
            }
            if table
                .get(key)
                .is_some_and(|row| Arc::ptr_eq(row, &locked.row))
            {
                table.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sku(id: &str) -> ProductId {
        ProductId::new(id)
    }

    async fn store_with_stock(entries: &[(&str, i64)]) -> InMemoryStore {
        let store = InMemoryStore::with_config(StoreConfig::with_lock_timeout(
            Duration::from_millis(100),
        ));
        for (id, stock) in entries {
            store.set_stock(*id, *stock).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn lock_and_read_returns_stock() {
        let store = store_with_stock(&[("SKU-1", 5)]).await;
        let mut tx = store.begin().await.unwrap();

        assert_eq!(tx.lock_and_read(&sku("SKU-1")).await.unwrap(), Some(5));
        assert_eq!(tx.lock_and_read(&sku("SKU-404")).await.unwrap(), None);
        assert_eq!(tx.locked_products(), vec![sku("SKU-1")]);
    }

    #[tokio::test]
    async fn decrement_without_lock_is_contract_violation() {
        let store = store_with_stock(&[("SKU-1", 5)]).await;
        let mut tx = store.begin().await.unwrap();

        let result = tx.decrement(&sku("SKU-1"), 1).await;
        assert!(matches!(result, Err(StoreError::LockNotHeld { .. })));
    }

    #[tokio::test]
    async fn decrement_never_goes_negative() {
        let store = store_with_stock(&[("SKU-1", 2)]).await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-1")).await.unwrap();

        let result = tx.decrement(&sku("SKU-1"), 3).await;
        assert!(matches!(
            result,
            Err(StoreError::StockUnderflow {
                stock: 2,
                quantity: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn commit_makes_decrement_visible() {
        let store = store_with_stock(&[("SKU-1", 5)]).await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-1")).await.unwrap();
        assert_eq!(tx.decrement(&sku("SKU-1"), 3).await.unwrap(), 2);

        // Not visible before commit
        assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(5));

        tx.commit().await.unwrap();
        assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn relock_in_same_transaction_sees_staged_value() {
        let store = store_with_stock(&[("SKU-1", 5)]).await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-1")).await.unwrap();
        tx.decrement(&sku("SKU-1"), 4).await.unwrap();

        assert_eq!(tx.lock_and_read(&sku("SKU-1")).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_writes() {
        let store = store_with_stock(&[("SKU-1", 5)]).await;

        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-1")).await.unwrap();
        tx.decrement(&sku("SKU-1"), 5).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(5));

        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-1")).await.unwrap();
        tx.decrement(&sku("SKU-1"), 5).await.unwrap();
        drop(tx);
        assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn second_transaction_times_out_on_held_lock() {
        let store = store_with_stock(&[("SKU-1", 5)]).await;

        let mut holder = store.begin().await.unwrap();
        holder.lock_and_read(&sku("SKU-1")).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let result = waiter.lock_and_read(&sku("SKU-1")).await;
        assert!(matches!(result, Err(StoreError::LockTimeout { .. })));

        // Snapshot reads do not wait for the lock
        assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn waiter_sees_committed_value_after_release() {
        let store = InMemoryStore::new();
        store.set_stock("SKU-1", 5).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.lock_and_read(&sku("SKU-1")).await.unwrap();
        holder.decrement(&sku("SKU-1"), 2).await.unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = waiter_store.begin().await.unwrap();
            tx.lock_and_read(&sku("SKU-1")).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn disjoint_rows_do_not_block() {
        let store = store_with_stock(&[("SKU-1", 5), ("SKU-2", 5)]).await;

        let mut first = store.begin().await.unwrap();
        first.lock_and_read(&sku("SKU-1")).await.unwrap();

        let mut second = store.begin().await.unwrap();
        assert_eq!(second.lock_and_read(&sku("SKU-2")).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn order_status_write_is_transactional() {
        let store = InMemoryStore::new();
        let order_id = OrderId::new();
        store
            .insert_order(
                order_id,
                OrderStatus::Pending,
                vec![LineItemDemand::new("SKU-1", 2)],
            )
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.lock_order(order_id).await.unwrap(),
            Some(OrderStatus::Pending)
        );
        assert_eq!(
            tx.get_items(order_id).await.unwrap(),
            vec![LineItemDemand::new("SKU-1", 2)]
        );
        tx.set_status(order_id, OrderStatus::Processing).await.unwrap();
        drop(tx);
        assert_eq!(
            store.order_status(order_id).await.unwrap(),
            Some(OrderStatus::Pending)
        );

        let mut tx = store.begin().await.unwrap();
        tx.set_status(order_id, OrderStatus::Processing).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            store.order_status(order_id).await.unwrap(),
            Some(OrderStatus::Processing)
        );
    }

    #[tokio::test]
    async fn set_status_on_missing_order_fails() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let result = tx.set_status(OrderId::new(), OrderStatus::Processing).await;
        assert!(matches!(result, Err(StoreError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn idempotency_claim_then_replay() {
        let store = InMemoryStore::new();
        let key = IdempotencyKey::new("req-1");
        let fingerprint = serde_json::json!({"items": [["SKU-1", 1]]});
        let outcome = serde_json::json!({"reserved": 1});

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.claim(&key, &fingerprint).await.unwrap(),
            IdempotencyClaim::Claimed
        );
        tx.record(&key, &outcome).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.recorded_request_count().await, 1);

        let mut tx = store.begin().await.unwrap();
        match tx.claim(&key, &fingerprint).await.unwrap() {
            IdempotencyClaim::Completed(record) => {
                assert_eq!(record.fingerprint, fingerprint);
                assert_eq!(record.outcome, outcome);
            }
            other => panic!("expected completed claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rolled_back_claim_leaves_key_free() {
        let store = InMemoryStore::new();
        let key = IdempotencyKey::new("req-2");
        let fingerprint = serde_json::json!("f");

        let mut tx = store.begin().await.unwrap();
        tx.claim(&key, &fingerprint).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.claim(&key, &fingerprint).await.unwrap(),
            IdempotencyClaim::Claimed
        );
        assert_eq!(store.recorded_request_count().await, 0);
    }

    #[tokio::test]
    async fn injected_commit_failure_discards_writes() {
        let store = store_with_stock(&[("SKU-1", 5)]).await;
        store.fail_next_commit();

        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-1")).await.unwrap();
        tx.decrement(&sku("SKU-1"), 5).await.unwrap();

        let result = tx.commit().await;
        assert!(matches!(result, Err(StoreError::CommitFailed(_))));
        assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn cancelled_commit_applies_all_writes_or_none() {
        let store = store_with_stock(&[("SKU-A", 5), ("SKU-B", 5)]).await;

        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-A")).await.unwrap();
        tx.lock_and_read(&sku("SKU-B")).await.unwrap();
        tx.decrement(&sku("SKU-A"), 3).await.unwrap();
        tx.decrement(&sku("SKU-B"), 3).await.unwrap();

        // A concurrent snapshot reader must not make a cancelled commit stop
        // between two rows.
        let reader_store = store.clone();
        let reader = tokio::spawn(async move {
            for _ in 0..100 {
                reader_store.stock_level(&sku("SKU-B")).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let _ = tokio::time::timeout(Duration::ZERO, tx.commit()).await;
        reader.await.unwrap();

        let a = store.stock_level(&sku("SKU-A")).await.unwrap();
        let b = store.stock_level(&sku("SKU-B")).await.unwrap();
        assert_eq!(a, b);
        assert!(a == Some(5) || a == Some(2), "unexpected stock {a:?}");

        // Whatever happened, both rows are free again
        let mut tx = store.begin().await.unwrap();
        tx.lock_and_read(&sku("SKU-A")).await.unwrap();
        tx.lock_and_read(&sku("SKU-B")).await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_claims_leave_no_rows_behind() {
        let store = InMemoryStore::new();
        let fingerprint = serde_json::json!("f");
        let request_rows = |store: &InMemoryStore| read(&store.tables.requests).len();

        for n in 0..10 {
            let key = IdempotencyKey::new(format!("req-{n}"));
            let mut tx = store.begin().await.unwrap();
            tx.claim(&key, &fingerprint).await.unwrap();
            if n % 2 == 0 {
                tx.rollback().await.unwrap();
            } else {
                drop(tx);
            }
        }
        assert_eq!(request_rows(&store), 0);

        store.fail_next_commit();
        let mut tx = store.begin().await.unwrap();
        tx.claim(&IdempotencyKey::new("req-failed"), &fingerprint)
            .await
            .unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(request_rows(&store), 0);

        let key = IdempotencyKey::new("req-kept");
        let mut tx = store.begin().await.unwrap();
        tx.claim(&key, &fingerprint).await.unwrap();
        tx.record(&key, &serde_json::json!({"reserved": 1}))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(request_rows(&store), 1);
        assert_eq!(store.recorded_request_count().await, 1);
    }

    #[tokio::test]
    async fn abandoned_claim_keeps_row_for_waiting_transaction() {
        let store = InMemoryStore::new();
        let key = IdempotencyKey::new("req-shared");
        let fingerprint = serde_json::json!("f");

        let mut holder = store.begin().await.unwrap();
        holder.claim(&key, &fingerprint).await.unwrap();

        let waiter_store = store.clone();
        let waiter_key = key.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = waiter_store.begin().await.unwrap();
            let claim = tx.claim(&waiter_key, &serde_json::json!("f")).await.unwrap();
            tx.record(&waiter_key, &serde_json::json!("done"))
                .await
                .unwrap();
            tx.commit().await.unwrap();
            claim
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.rollback().await.unwrap();

        assert_eq!(waiter.await.unwrap(), IdempotencyClaim::Claimed);
        assert_eq!(store.recorded_request_count().await, 1);

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.claim(&key, &fingerprint).await.unwrap(),
            IdempotencyClaim::Completed(_)
        ));
    }

    #[tokio::test]
    async fn negative_seed_rejected() {
        let store = InMemoryStore::new();
        let result = store.set_stock("SKU-1", -1).await;
        assert!(matches!(result, Err(StoreError::InvalidData(_))));
    }
}
