use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IdempotencyKey, OrderId, ProductId};
use domain::{LineItemDemand, OrderStatus};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    Result, StoreConfig, StoreError,
    store::{
        IdempotencyClaim, IdempotencyLog, IdempotencyRecord, InventoryStore, OrderRepository,
        ReservationStore, StoreTransaction,
    },
};

/// PostgreSQL-backed reservation store.
///
/// Row locks are `SELECT ... FOR UPDATE` locks held by the enclosing
/// transaction. Every transaction sets a transaction-local `lock_timeout`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    config: StoreConfig,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store with default settings.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, StoreConfig::default())
    }

    /// Creates a new PostgreSQL store with the given settings.
    pub fn with_config(pool: PgPool, config: StoreConfig) -> Self {
        Self { pool, config }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Seeds or overwrites the stock of a product.
    pub async fn upsert_product(&self, product_id: &ProductId, stock: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, stock, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET
                stock = EXCLUDED.stock,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(product_id.as_str())
        .bind(stock)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts an order with its line items in a single transaction.
    pub async fn insert_order(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        items: &[LineItemDemand],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, status, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        for (line_no, item) in items.iter().enumerate() {
            let line_no = i32::try_from(line_no)
                .map_err(|_| StoreError::InvalidData("too many order lines".to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, line_no, product_id, quantity)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(order_id.as_uuid())
            .bind(line_no)
            .bind(item.product_id.as_str())
            .bind(item.quantity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for PostgresStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.config.lock_timeout_millis()))
            .execute(&mut *tx)
            .await?;

        Ok(PostgresTransaction {
            tx,
            locked_products: HashSet::new(),
        })
    }

    async fn stock_level(&self, product_id: &ProductId) -> Result<Option<i64>> {
        let stock: Option<i64> = sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
            .bind(product_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(stock)
    }

    async fn order_status(&self, order_id: OrderId) -> Result<Option<OrderStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        status.map(|s| parse_status(&s)).transpose()
    }
}

/// Transaction over a [`PostgresStore`].
///
/// Dropping it without commit rolls back on the connection.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    locked_products: HashSet<ProductId>,
}

fn parse_status(value: &str) -> Result<OrderStatus> {
    value
        .parse()
        .map_err(|e: domain::UnknownOrderStatus| StoreError::InvalidData(e.to_string()))
}

fn row_to_record(row: PgRow) -> Result<IdempotencyRecord> {
    let outcome: Option<serde_json::Value> = row.try_get("outcome")?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;

    match (outcome, completed_at) {
        (Some(outcome), Some(recorded_at)) => Ok(IdempotencyRecord {
            fingerprint: row.try_get("fingerprint")?,
            outcome,
            recorded_at,
        }),
        _ => Err(StoreError::InvalidData(
            "idempotency record committed without an outcome".to_string(),
        )),
    }
}

#[async_trait]
impl InventoryStore for PostgresTransaction {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn lock_and_read(&mut self, product_id: &ProductId) -> Result<Option<i64>> {
        let stock: Option<i64> =
            sqlx::query_scalar("SELECT stock FROM products WHERE id = $1 FOR UPDATE")
                .bind(product_id.as_str())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| {
                    StoreError::from_sqlx(e, || format!("product {product_id}"))
                })?;

        if stock.is_some() {
            self.locked_products.insert(product_id.clone());
            tracing::debug!(%product_id, ?stock, "product row locked");
        }
        Ok(stock)
    }

    async fn decrement(&mut self, product_id: &ProductId, quantity: i64) -> Result<i64> {
        if quantity <= 0 {
            return Err(StoreError::InvalidData(format!(
                "decrement for {product_id} must be positive, got {quantity}"
            )));
        }
        if !self.locked_products.contains(product_id) {
            return Err(StoreError::LockNotHeld {
                product_id: product_id.clone(),
            });
        }

        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE products
            SET stock = stock - $1, updated_at = NOW()
            WHERE id = $2 AND stock >= $1
            RETURNING stock
            "#,
        )
        .bind(quantity)
        .bind(product_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        match remaining {
            Some(stock) => Ok(stock),
            None => {
                let stock: i64 = sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
                    .bind(product_id.as_str())
                    .fetch_one(&mut *self.tx)
                    .await?;
                Err(StoreError::StockUnderflow {
                    product_id: product_id.clone(),
                    stock,
                    quantity,
                })
            }
        }
    }
}

#[async_trait]
impl OrderRepository for PostgresTransaction {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<OrderStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(order_id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| StoreError::from_sqlx(e, || format!("order {order_id}")))?;

        status.map(|s| parse_status(&s)).transpose()
    }

    async fn get_items(&mut self, order_id: OrderId) -> Result<Vec<LineItemDemand>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, quantity
            FROM order_items
            WHERE order_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<LineItemDemand> {
                Ok(LineItemDemand {
                    product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
                    quantity: row.try_get("quantity")?,
                })
            })
            .collect()
    }

    async fn set_status(&mut self, order_id: OrderId, status: OrderStatus) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(order_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StoreError::from_sqlx(e, || format!("order {order_id}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OrderNotFound(order_id));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLog for PostgresTransaction {
    async fn claim(
        &mut self,
        key: &IdempotencyKey,
        fingerprint: &serde_json::Value,
    ) -> Result<IdempotencyClaim> {
        // Blocks on the unique index while another transaction holds an
        // uncommitted row for the same key.
        let inserted = sqlx::query(
            r#"
            INSERT INTO reservation_requests (idempotency_key, fingerprint, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(fingerprint)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::from_sqlx(e, || format!("idempotency key {key}")))?;

        if inserted.rows_affected() == 1 {
            return Ok(IdempotencyClaim::Claimed);
        }

        let row = sqlx::query(
            r#"
            SELECT fingerprint, outcome, completed_at
            FROM reservation_requests
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(IdempotencyClaim::Completed(row_to_record(row)?))
    }

    async fn record(&mut self, key: &IdempotencyKey, outcome: &serde_json::Value) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reservation_requests
            SET outcome = $2, completed_at = NOW()
            WHERE idempotency_key = $1 AND outcome IS NULL
            "#,
        )
        .bind(key.as_str())
        .bind(outcome)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidData(format!(
                "idempotency key {key} was not claimed by this transaction"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(|e| match StoreError::from(e) {
            StoreError::Database(e) => StoreError::CommitFailed(e.to_string()),
            other => other,
        })
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
