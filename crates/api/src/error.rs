//! API error types with HTTP response mapping.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reservation::{ErrorKind, ReservationError};
use serde_json::json;
use stock_store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Reservation rejected or aborted.
    Reservation(ReservationError),
    /// Storage error outside a reservation (snapshot reads).
    Store(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({ "error": msg, "kind": ErrorKind::NotFound.as_str() }),
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": msg, "kind": ErrorKind::Validation.as_str() }),
            ),
            ApiError::Reservation(err) => reservation_error_to_response(err),
            ApiError::Store(err) => store_error_to_response(err),
        };

        (status, axum::Json(body)).into_response()
    }
}

fn reservation_error_to_response(err: ReservationError) -> (StatusCode, serde_json::Value) {
    let kind = err.kind().as_str();
    match &err {
        ReservationError::Validation(_) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": err.to_string(), "kind": kind }),
        ),
        ReservationError::NotFound { product_id } => (
            StatusCode::NOT_FOUND,
            json!({ "error": err.to_string(), "kind": kind, "product_id": product_id }),
        ),
        ReservationError::OrderNotFound(order_id) => (
            StatusCode::NOT_FOUND,
            json!({ "error": err.to_string(), "kind": kind, "order_id": order_id }),
        ),
        ReservationError::InsufficientStock {
            product_id,
            have,
            need,
        } => (
            StatusCode::CONFLICT,
            json!({
                "error": err.to_string(),
                "kind": kind,
                "product_id": product_id,
                "have": have,
                "need": need,
            }),
        ),
        ReservationError::StateConflict { order_id, status } => (
            StatusCode::CONFLICT,
            json!({
                "error": err.to_string(),
                "kind": kind,
                "order_id": order_id,
                "status": status,
            }),
        ),
        ReservationError::IdempotencyKeyReused { .. } => (
            StatusCode::CONFLICT,
            json!({ "error": err.to_string(), "kind": kind }),
        ),
        ReservationError::TransactionFailure(store_err) => {
            tracing::error!(error = %store_err, "reservation transaction failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": err.to_string(),
                    "kind": kind,
                    "retryable": err.is_retryable(),
                }),
            )
        }
    }
}

fn store_error_to_response(err: StoreError) -> (StatusCode, serde_json::Value) {
    tracing::error!(error = %err, "store read failed");
    let status = if err.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        json!({
            "error": err.to_string(),
            "kind": ErrorKind::TransactionFailure.as_str(),
            "retryable": err.is_transient(),
        }),
    )
}

impl From<ReservationError> for ApiError {
    fn from(err: ReservationError) -> Self {
        ApiError::Reservation(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
