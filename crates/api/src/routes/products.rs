//! Product stock endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ProductId;
use serde::Serialize;
use stock_store::ReservationStore;

use super::reservations::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct StockResponse {
    pub product_id: String,
    pub stock: i64,
}

/// GET /products/{id}/stock: last committed stock, without locking.
#[tracing::instrument(skip(state))]
pub async fn stock<S: ReservationStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<StockResponse>, ApiError> {
    let product_id = ProductId::new(id);

    let stock = state
        .coordinator
        .store()
        .stock_level(&product_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Product {product_id} not found")))?;

    Ok(Json(StockResponse {
        product_id: product_id.as_str().to_string(),
        stock,
    }))
}
