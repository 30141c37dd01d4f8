//! Domain layer for the stock reservation system.
//!
//! This crate provides the value types the reservation core operates on:
//! - `LineItemDemand` and the validated, canonically ordered `DemandBatch`
//! - `OrderStatus` state machine with its transition guards
//! - `ValidationError` for malformed input

pub mod demand;
pub mod error;
pub mod status;

pub use demand::{DemandBatch, LineItemDemand};
pub use error::{UnknownOrderStatus, ValidationError};
pub use status::OrderStatus;
