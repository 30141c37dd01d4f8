//! Successful reservation results.

use common::OrderId;
use domain::LineItemDemand;
use serde::Serialize;

/// Result of a successful `reserve_by_items` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reservation {
    /// Reserved demands, one per product, in ascending product-id order.
    pub reserved: Vec<LineItemDemand>,

    /// True if this result was replayed from an earlier call with the same
    /// idempotency key.
    pub replayed: bool,
}

impl Reservation {
    /// Returns the total number of units reserved.
    pub fn total_units(&self) -> i64 {
        self.reserved.iter().map(|item| item.quantity).sum()
    }
}

/// Result of a successful `reserve_by_order_id` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderReservation {
    /// The order whose items were reserved.
    pub order_id: OrderId,

    /// Reserved demands, one per product, in ascending product-id order.
    pub reserved: Vec<LineItemDemand>,

    /// True if this result was replayed from an earlier call with the same
    /// idempotency key.
    pub replayed: bool,
}

impl OrderReservation {
    /// Number of distinct products reserved.
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Returns the total number of units reserved.
    pub fn total_units(&self) -> i64 {
        self.reserved.iter().map(|item| item.quantity).sum()
    }
}
