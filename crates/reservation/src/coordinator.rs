//! Reservation coordinator for all-or-nothing stock reservations.

use std::time::Instant;

use common::{IdempotencyKey, OrderId};
use domain::{DemandBatch, LineItemDemand, OrderStatus};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stock_store::{IdempotencyClaim, ReservationStore, StoreTransaction};

use crate::error::{ReservationError, Result};
use crate::options::ReserveOptions;
use crate::outcome::{OrderReservation, Reservation};

/// Entry point label for ad-hoc item lists.
pub const ENTRY_POINT_ITEMS: &str = "reserve_by_items";

/// Entry point label for stored orders.
pub const ENTRY_POINT_ORDER: &str = "reserve_by_order_id";

/// What to do with a transaction once the work inside it is done.
enum Decision<T> {
    /// Make the writes visible.
    Commit(T),
    /// Nothing was written; release the locks and return the value.
    Release(T),
}

/// Reserves stock for a batch of line items atomically.
///
/// Each call runs in one store transaction. Rows are locked in a fixed global
/// order (idempotency key, then order row, then products by ascending id), so
/// two overlapping batches never wait on each other in a cycle. Any failure
/// rolls the whole transaction back.
pub struct ReservationCoordinator<S: ReservationStore> {
    store: S,
}

impl<S: ReservationStore> ReservationCoordinator<S> {
    /// Creates a new coordinator over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reserves every line item or none of them.
    ///
    /// Duplicate product ids are merged by summing their quantities. An empty
    /// list succeeds without opening a transaction.
    #[tracing::instrument(skip(self, items, options), fields(entry_point = ENTRY_POINT_ITEMS, lines = items.len()))]
    pub async fn reserve_by_items(
        &self,
        items: Vec<LineItemDemand>,
        options: ReserveOptions,
    ) -> Result<Reservation> {
        let started = Instant::now();
        let result = self.reserve_items_inner(items, &options).await;
        observe(
            ENTRY_POINT_ITEMS,
            started,
            result.as_ref().map(|r| (r.total_units(), r.replayed)),
        );
        result
    }

    /// Reserves every line item of a stored order and moves the order from
    /// Pending to Processing in the same transaction.
    ///
    /// An order with no items succeeds with nothing reserved and its status
    /// unchanged.
    #[tracing::instrument(skip(self, options), fields(entry_point = ENTRY_POINT_ORDER))]
    pub async fn reserve_by_order_id(
        &self,
        order_id: OrderId,
        options: ReserveOptions,
    ) -> Result<OrderReservation> {
        let started = Instant::now();
        let result = self.reserve_order_inner(order_id, &options).await;
        observe(
            ENTRY_POINT_ORDER,
            started,
            result.as_ref().map(|r| (r.total_units(), r.replayed)),
        );
        result
    }

    async fn reserve_items_inner(
        &self,
        items: Vec<LineItemDemand>,
        options: &ReserveOptions,
    ) -> Result<Reservation> {
        if items.is_empty() {
            return Ok(Reservation::default());
        }

        // Validation happens before any lock is taken
        let batch = DemandBatch::new(items)?;

        let mut tx = self.store.begin().await?;
        let decision = items_in_tx(&mut tx, batch, options).await;
        finish(tx, decision).await
    }

    async fn reserve_order_inner(
        &self,
        order_id: OrderId,
        options: &ReserveOptions,
    ) -> Result<OrderReservation> {
        let mut tx = self.store.begin().await?;
        let decision = order_in_tx(&mut tx, order_id, options).await;
        finish(tx, decision).await
    }
}

async fn items_in_tx<T: StoreTransaction>(
    tx: &mut T,
    batch: DemandBatch,
    options: &ReserveOptions,
) -> Result<Decision<Reservation>> {
    if let Some(key) = &options.idempotency_key {
        let fingerprint = json!({ "entry_point": ENTRY_POINT_ITEMS, "items": &batch });
        if let Some(reserved) = claim_key(tx, key, &fingerprint).await? {
            return Ok(Decision::Release(Reservation {
                reserved,
                replayed: true,
            }));
        }
    }

    reserve_batch(tx, &batch).await?;

    if let Some(key) = &options.idempotency_key {
        tx.record(key, &serde_json::to_value(&batch)?).await?;
    }

    Ok(Decision::Commit(Reservation {
        reserved: batch.into_items(),
        replayed: false,
    }))
}

async fn order_in_tx<T: StoreTransaction>(
    tx: &mut T,
    order_id: OrderId,
    options: &ReserveOptions,
) -> Result<Decision<OrderReservation>> {
    if let Some(key) = &options.idempotency_key {
        let fingerprint = json!({ "entry_point": ENTRY_POINT_ORDER, "order_id": order_id });
        if let Some(reserved) = claim_key(tx, key, &fingerprint).await? {
            return Ok(Decision::Release(OrderReservation {
                order_id,
                reserved,
                replayed: true,
            }));
        }
    }

    let status = tx
        .lock_order(order_id)
        .await?
        .ok_or(ReservationError::OrderNotFound(order_id))?;

    let items = tx.get_items(order_id).await?;
    if items.is_empty() {
        tracing::debug!(%order_id, %status, "order has no items, nothing to reserve");
        return Ok(Decision::Release(OrderReservation {
            order_id,
            reserved: Vec::new(),
            replayed: false,
        }));
    }

    if !status.can_reserve() {
        return Err(ReservationError::StateConflict { order_id, status });
    }

    let batch = DemandBatch::new(items)?;
    reserve_batch(tx, &batch).await?;
    tx.set_status(order_id, OrderStatus::Processing).await?;

    if let Some(key) = &options.idempotency_key {
        tx.record(key, &serde_json::to_value(&batch)?).await?;
    }

    Ok(Decision::Commit(OrderReservation {
        order_id,
        reserved: batch.into_items(),
        replayed: false,
    }))
}

/// Locks, checks and decrements every product in ascending id order.
///
/// Stops at the first product that is missing or short. Nothing is undone
/// here; the caller rolls the transaction back.
async fn reserve_batch<T: StoreTransaction>(tx: &mut T, batch: &DemandBatch) -> Result<()> {
    for demand in batch.iter() {
        let have = tx
            .lock_and_read(&demand.product_id)
            .await?
            .ok_or_else(|| ReservationError::NotFound {
                product_id: demand.product_id.clone(),
            })?;

        if have < demand.quantity {
            return Err(ReservationError::InsufficientStock {
                product_id: demand.product_id.clone(),
                have,
                need: demand.quantity,
            });
        }

        tx.decrement(&demand.product_id, demand.quantity).await?;
    }
    Ok(())
}

/// Claims the idempotency key, returning the recorded items if an earlier
/// identical request already committed under it.
async fn claim_key<T: StoreTransaction, R: DeserializeOwned>(
    tx: &mut T,
    key: &IdempotencyKey,
    fingerprint: &Value,
) -> Result<Option<R>> {
    match tx.claim(key, fingerprint).await? {
        IdempotencyClaim::Claimed => Ok(None),
        IdempotencyClaim::Completed(record) if record.fingerprint == *fingerprint => {
            tracing::info!(idempotency_key = %key, "replaying recorded reservation");
            Ok(Some(serde_json::from_value(record.outcome)?))
        }
        IdempotencyClaim::Completed(_) => {
            Err(ReservationError::IdempotencyKeyReused { key: key.clone() })
        }
    }
}

/// Ends the transaction according to the decision.
async fn finish<T: StoreTransaction, V>(tx: T, decision: Result<Decision<V>>) -> Result<V> {
    match decision {
        Ok(Decision::Commit(value)) => {
            tx.commit().await?;
            Ok(value)
        }
        Ok(Decision::Release(value)) => {
            // Nothing was written, so a failed rollback cannot lose data
            if let Err(e) = tx.rollback().await {
                tracing::warn!(error = %e, "failed to release read-only transaction");
            }
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                tracing::warn!(error = %e, "rollback failed after aborted reservation");
            }
            Err(err)
        }
    }
}

fn observe(
    entry_point: &'static str,
    started: Instant,
    result: std::result::Result<(i64, bool), &ReservationError>,
) {
    metrics::histogram!("reservation_duration_seconds", "entry_point" => entry_point)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok((_, true)) => {
            metrics::counter!("reservations_total", "entry_point" => entry_point, "outcome" => "replayed")
                .increment(1);
            metrics::counter!("reservation_replays_total").increment(1);
        }
        Ok((units, false)) => {
            metrics::counter!("reservations_total", "entry_point" => entry_point, "outcome" => "reserved")
                .increment(1);
            metrics::counter!("reservation_units_reserved_total").increment(units as u64);
            tracing::info!(units, "reservation committed");
        }
        Err(err) => {
            let kind = err.kind().as_str();
            metrics::counter!("reservations_total", "entry_point" => entry_point, "outcome" => kind)
                .increment(1);
            if err.is_retryable() {
                tracing::warn!(error = %err, kind, "reservation aborted");
            } else {
                tracing::info!(error = %err, kind, "reservation rejected");
            }
        }
    }
}
