//! Ad-hoc item reservation endpoint and shared handler state.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use domain::LineItemDemand;
use reservation::{ReservationCoordinator, RetryPolicy};
use serde::{Deserialize, Serialize};
use stock_store::ReservationStore;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: ReservationStore> {
    pub coordinator: ReservationCoordinator<S>,
    pub retry_policy: RetryPolicy,
}

// -- Request types --

#[derive(Deserialize)]
pub struct ReserveItemsRequest {
    pub items: Vec<LineItemRequest>,
}

#[derive(Deserialize)]
pub struct LineItemRequest {
    pub product_id: String,
    pub quantity: i64,
}

// -- Response types --

#[derive(Serialize)]
pub struct LineItemResponse {
    pub product_id: String,
    pub quantity: i64,
}

#[derive(Serialize)]
pub struct ReservationResponse {
    pub reserved: Vec<LineItemResponse>,
    pub replayed: bool,
}

pub(crate) fn to_line_items(items: Vec<LineItemDemand>) -> Vec<LineItemResponse> {
    items
        .into_iter()
        .map(|item| LineItemResponse {
            product_id: item.product_id.as_str().to_string(),
            quantity: item.quantity,
        })
        .collect()
}

// -- Handlers --

/// POST /reservations: reserve a batch of line items atomically.
///
/// A body that is not valid JSON of the expected shape is a validation error.
#[tracing::instrument(skip(state, headers, payload), fields(lines = tracing::field::Empty))]
pub async fn reserve<S: ReservationStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    payload: Result<Json<ReserveItemsRequest>, JsonRejection>,
) -> Result<Json<ReservationResponse>, ApiError> {
    let Json(req) = payload?;
    tracing::Span::current().record("lines", req.items.len());
    let options = super::reserve_options(&headers)?;
    let items: Vec<LineItemDemand> = req
        .items
        .into_iter()
        .map(|item| LineItemDemand::new(item.product_id, item.quantity))
        .collect();

    let coordinator = &state.coordinator;
    let reservation = state
        .retry_policy
        .run(|| coordinator.reserve_by_items(items.clone(), options.clone()))
        .await?;

    Ok(Json(ReservationResponse {
        reserved: to_line_items(reservation.reserved),
        replayed: reservation.replayed,
    }))
}
