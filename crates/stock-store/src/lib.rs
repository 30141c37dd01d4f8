//! Transactional storage for the stock reservation core.
//!
//! A [`ReservationStore`] opens one [`StoreTransaction`] per reservation. The
//! transaction gives locked access to stock rows ([`InventoryStore`]), the
//! order row ([`OrderRepository`]) and the idempotency log
//! ([`IdempotencyLog`]), and is committed or rolled back as a unit.
//!
//! Two implementations are provided: [`InMemoryStore`] for tests and local
//! runs, and [`PostgresStore`] backed by `sqlx`.

pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, InMemoryTransaction};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use store::{
    IdempotencyClaim, IdempotencyLog, IdempotencyRecord, InventoryStore, OrderRepository,
    ReservationStore, StoreTransaction,
};
