//! Domain error types.

use common::ProductId;
use thiserror::Error;

/// Malformed reservation input, detected before any transaction opens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A line item has no product identifier.
    #[error("Product ID is required (line {line})")]
    MissingProductId { line: usize },

    /// A product identifier contains control characters.
    #[error("Product ID on line {line} contains control characters")]
    InvalidProductId { line: usize },

    /// A line item asks for zero or a negative quantity.
    #[error("Invalid quantity for product {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { product_id: ProductId, quantity: i64 },

    /// Merging duplicate lines for one product overflowed.
    #[error("Total quantity for product {product_id} is too large")]
    QuantityOverflow { product_id: ProductId },
}

/// A stored status string that is not one of the known order states.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown order status: {0}")]
pub struct UnknownOrderStatus(pub String);
