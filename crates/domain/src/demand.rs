//! Line-item demands and validated demand batches.

use std::collections::BTreeMap;

use common::ProductId;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A request for `quantity` units of one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemDemand {
    /// The product identifier.
    pub product_id: ProductId,

    /// Units requested. Must be greater than zero.
    pub quantity: i64,
}

impl LineItemDemand {
    /// Creates a new line-item demand.
    pub fn new(product_id: impl Into<ProductId>, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// A validated set of demands with one entry per product, in ascending
/// product-id order.
///
/// The ordering is the global lock order for product rows: every transaction
/// that touches more than one product acquires the locks by iterating a
/// `DemandBatch`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DemandBatch {
    items: Vec<LineItemDemand>,
}

impl DemandBatch {
    /// Validates raw line items and folds them into a canonical batch.
    ///
    /// Lines for the same product are merged by summing their quantities.
    pub fn new(
        items: impl IntoIterator<Item = LineItemDemand>,
    ) -> Result<Self, ValidationError> {
        let mut merged: BTreeMap<ProductId, i64> = BTreeMap::new();

        for (line, item) in items.into_iter().enumerate() {
            if item.product_id.is_blank() {
                return Err(ValidationError::MissingProductId { line });
            }
            if item.product_id.has_control_chars() {
                return Err(ValidationError::InvalidProductId { line });
            }
            if item.quantity <= 0 {
                return Err(ValidationError::InvalidQuantity {
                    product_id: item.product_id,
                    quantity: item.quantity,
                });
            }

            let total = merged.entry(item.product_id.clone()).or_insert(0);
            *total = total
                .checked_add(item.quantity)
                .ok_or(ValidationError::QuantityOverflow {
                    product_id: item.product_id,
                })?;
        }

        Ok(Self {
            items: merged
                .into_iter()
                .map(|(product_id, quantity)| LineItemDemand {
                    product_id,
                    quantity,
                })
                .collect(),
        })
    }

    /// Returns true if the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of distinct products in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Iterates the demands in lock order.
    pub fn iter(&self) -> impl Iterator<Item = &LineItemDemand> {
        self.items.iter()
    }

    /// Returns the demands in lock order.
    pub fn items(&self) -> &[LineItemDemand] {
        &self.items
    }

    /// Consumes the batch, returning the demands in lock order.
    pub fn into_items(self) -> Vec<LineItemDemand> {
        self.items
    }

    /// Sum of all requested units.
    pub fn total_units(&self) -> i64 {
        self.items.iter().map(|item| item.quantity).sum()
    }
}
