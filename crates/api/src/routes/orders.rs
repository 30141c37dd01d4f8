//! Order reservation and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Serialize;
use stock_store::ReservationStore;

use super::reservations::{AppState, LineItemResponse, to_line_items};
use crate::error::ApiError;

#[derive(Serialize)]
pub struct OrderReservationResponse {
    pub order_id: String,
    pub reserved_count: usize,
    pub reserved: Vec<LineItemResponse>,
    pub replayed: bool,
}

#[derive(Serialize)]
pub struct OrderStatusResponse {
    pub order_id: String,
    pub status: String,
}

/// POST /orders/{id}/reserve: reserve every item of a pending order.
#[tracing::instrument(skip(state, headers))]
pub async fn reserve<S: ReservationStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OrderReservationResponse>, ApiError> {
    let order_id = super::parse_order_id(&id)?;
    let options = super::reserve_options(&headers)?;

    let coordinator = &state.coordinator;
    let reservation = state
        .retry_policy
        .run(|| coordinator.reserve_by_order_id(order_id, options.clone()))
        .await?;

    Ok(Json(OrderReservationResponse {
        order_id: reservation.order_id.to_string(),
        reserved_count: reservation.reserved_count(),
        reserved: to_line_items(reservation.reserved),
        replayed: reservation.replayed,
    }))
}

/// GET /orders/{id}/status: last committed order status.
#[tracing::instrument(skip(state))]
pub async fn status<S: ReservationStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let order_id = super::parse_order_id(&id)?;

    let status = state
        .coordinator
        .store()
        .order_status(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;

    Ok(Json(OrderStatusResponse {
        order_id: order_id.to_string(),
        status: status.to_string(),
    }))
}
