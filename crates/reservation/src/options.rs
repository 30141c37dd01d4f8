//! Per-call reservation options.

use common::IdempotencyKey;

/// Options for a single reservation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReserveOptions {
    /// Key under which the outcome is recorded. A repeated call with the same
    /// key and the same request returns the recorded outcome instead of
    /// reserving again. If None, no deduplication is performed.
    pub idempotency_key: Option<IdempotencyKey>,
}

impl ReserveOptions {
    /// Creates options with no idempotency key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options that deduplicate on `key`.
    pub fn with_idempotency_key(key: impl Into<IdempotencyKey>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
        }
    }
}
