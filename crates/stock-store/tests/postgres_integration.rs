//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p stock-store --test postgres_integration
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::{IdempotencyKey, OrderId, ProductId};
use domain::{LineItemDemand, OrderStatus};
use serial_test::serial;
use sqlx::PgPool;
use stock_store::{
    IdempotencyClaim, IdempotencyLog, InventoryStore, OrderRepository, PostgresStore,
    ReservationStore, StoreConfig, StoreError, StoreTransaction,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Create a temporary pool just for migrations
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_inventory_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE order_items, orders, products, reservation_requests")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::with_config(
        pool,
        StoreConfig::with_lock_timeout(Duration::from_millis(200)),
    )
}

fn sku(id: &str) -> ProductId {
    ProductId::new(id)
}

#[tokio::test]
#[serial]
async fn lock_decrement_and_commit() {
    let store = get_test_store().await;
    store.upsert_product(&sku("SKU-1"), 5).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.lock_and_read(&sku("SKU-1")).await.unwrap(), Some(5));
    assert_eq!(tx.decrement(&sku("SKU-1"), 3).await.unwrap(), 2);

    // Uncommitted write is invisible outside the transaction
    assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(5));

    tx.commit().await.unwrap();
    assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(2));
}

#[tokio::test]
#[serial]
async fn missing_product_reads_none() {
    let store = get_test_store().await;
    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.lock_and_read(&sku("SKU-404")).await.unwrap(), None);
}

#[tokio::test]
#[serial]
async fn decrement_requires_lock() {
    let store = get_test_store().await;
    store.upsert_product(&sku("SKU-1"), 5).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let result = tx.decrement(&sku("SKU-1"), 1).await;
    assert!(matches!(result, Err(StoreError::LockNotHeld { .. })));
}

#[tokio::test]
#[serial]
async fn decrement_refuses_underflow() {
    let store = get_test_store().await;
    store.upsert_product(&sku("SKU-1"), 2).await.unwrap();

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
#[serial]
async fn rollback_discards_decrement() {
    let store = get_test_store().await;
    store.upsert_product(&sku("SKU-1"), 5).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.lock_and_read(&sku("SKU-1")).await.unwrap();
    tx.decrement(&sku("SKU-1"), 5).await.unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(store.stock_level(&sku("SKU-1")).await.unwrap(), Some(5));
}

#[tokio::test]
#[serial]
async fn held_lock_times_out_second_transaction() {
    let store = get_test_store().await;
    store.upsert_product(&sku("SKU-1"), 5).await.unwrap();

    let mut holder = store.begin().await.unwrap();
    holder.lock_and_read(&sku("SKU-1")).await.unwrap();

    let mut waiter = store.begin().await.unwrap();
    let result = waiter.lock_and_read(&sku("SKU-1")).await;
    assert!(matches!(result, Err(StoreError::LockTimeout { .. })));

    holder.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
async fn order_lock_and_status_transition() {
    let store = get_test_store().await;
    let order_id = OrderId::new();
    store
        .insert_order(
            order_id,
            OrderStatus::Pending,
            &[
                LineItemDemand::new("SKU-2", 1),
                LineItemDemand::new("SKU-1", 4),
            ],
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
        vec![
            LineItemDemand::new("SKU-2", 1),
            LineItemDemand::new("SKU-1", 4),
        ]
    );
    tx.set_status(order_id, OrderStatus::Processing).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        store.order_status(order_id).await.unwrap(),
        Some(OrderStatus::Processing)
    );
}

#[tokio::test]
#[serial]
async fn missing_order_reads_none() {
    let store = get_test_store().await;
    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.lock_order(OrderId::new()).await.unwrap(), None);

    let result = tx.set_status(OrderId::new(), OrderStatus::Processing).await;
    assert!(matches!(result, Err(StoreError::OrderNotFound(_))));
}

#[tokio::test]
#[serial]
async fn idempotency_key_claim_and_replay() {
    let store = get_test_store().await;
    let key = IdempotencyKey::new("req-1");
    let fingerprint = serde_json::json!({"entry_point": "items"});
    let outcome = serde_json::json!({"reserved": []});

    let mut tx = store.begin().await.unwrap();
    assert_eq!(
        tx.claim(&key, &fingerprint).await.unwrap(),
        IdempotencyClaim::Claimed
    );
    tx.record(&key, &outcome).await.unwrap();
    tx.commit().await.unwrap();

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
#[serial]
async fn concurrent_claim_waits_for_first_transaction() {
    let store = get_test_store().await;
    let key = IdempotencyKey::new("req-2");
    let fingerprint = serde_json::json!("f");

    let mut first = store.begin().await.unwrap();
    first.claim(&key, &fingerprint).await.unwrap();

    // The first claim is uncommitted, so the second blocks until timeout
    let mut second = store.begin().await.unwrap();
    let result = second.claim(&key, &fingerprint).await;
    assert!(matches!(result, Err(StoreError::LockTimeout { .. })));
    drop(second);

    first.rollback().await.unwrap();

    let mut third = store.begin().await.unwrap();
    assert_eq!(
        third.claim(&key, &fingerprint).await.unwrap(),
        IdempotencyClaim::Claimed
    );
}
