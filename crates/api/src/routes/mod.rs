//! HTTP route handlers.

pub mod health;
pub mod metrics;
pub mod orders;
pub mod products;
pub mod reservations;

use axum::http::HeaderMap;
use common::{IdempotencyKey, OrderId};
use reservation::ReserveOptions;

use crate::error::ApiError;

/// Header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Builds reservation options from request headers.
pub(crate) fn reserve_options(headers: &HeaderMap) -> Result<ReserveOptions, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(ReserveOptions::new());
    };

    let key = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("Idempotency-Key must be visible ASCII".to_string()))?
        .trim();
    if key.is_empty() {
        return Err(ApiError::BadRequest(
            "Idempotency-Key must not be empty".to_string(),
        ));
    }

    Ok(ReserveOptions::with_idempotency_key(IdempotencyKey::new(key)))
}

/// Parses an order id path segment.
pub(crate) fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid order id: {e}")))?;
    Ok(OrderId::from_uuid(uuid))
}
