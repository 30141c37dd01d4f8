//! HTTP API server with observability for the stock reservation core.
//!
//! Provides REST endpoints for reserving stock by item list or by order,
//! plus snapshot reads, with structured logging (tracing) and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use reservation::{ReservationCoordinator, RetryPolicy};
use stock_store::ReservationStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::reservations::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: ReservationStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/reservations", post(routes::reservations::reserve::<S>))
        .route("/orders/{id}/reserve", post(routes::orders::reserve::<S>))
        .route("/orders/{id}/status", get(routes::orders::status::<S>))
        .route("/products/{id}/stock", get(routes::products::stock::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state over the given store.
pub fn create_state<S: ReservationStore>(store: S, retry_policy: RetryPolicy) -> Arc<AppState<S>> {
    Arc::new(AppState {
        coordinator: ReservationCoordinator::new(store),
        retry_policy,
    })
}
