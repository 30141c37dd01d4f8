//! All-or-nothing stock reservation.
//!
//! The [`ReservationCoordinator`] reserves a batch of line items against
//! per-product stock counters. Either every item in the batch is reserved or
//! none is, and concurrent callers can never drive a counter below zero.
//!
//! A reservation proceeds in these steps, inside one store transaction:
//! 1. Claim the idempotency key, if one was supplied
//! 2. Lock the order row (order entry point only)
//! 3. Lock, check and decrement each product in ascending id order
//! 4. Move the order to Processing (order entry point only)
//! 5. Record the outcome and commit
//!
//! If any step fails, the transaction is rolled back.

pub mod coordinator;
pub mod error;
pub mod options;
pub mod outcome;
pub mod retry;

pub use coordinator::{ENTRY_POINT_ITEMS, ENTRY_POINT_ORDER, ReservationCoordinator};
pub use error::{ErrorKind, ReservationError, Result};
pub use options::ReserveOptions;
pub use outcome::{OrderReservation, Reservation};
pub use retry::RetryPolicy;
