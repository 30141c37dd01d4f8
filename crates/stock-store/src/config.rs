//! Store-level settings shared by every backend.

use std::time::Duration;

/// Default upper bound on a single row-lock wait.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings applied to every transaction a store opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum time a transaction waits for one row lock before aborting.
    pub lock_timeout: Duration,
}

impl StoreConfig {
    /// Creates a configuration with the given lock timeout.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    /// Lock timeout in whole milliseconds, never below one.
    pub fn lock_timeout_millis(&self) -> u64 {
        u64::try_from(self.lock_timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}
