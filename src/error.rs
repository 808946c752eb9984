//! Core error taxonomy
//! Mission: explicit result values at every component boundary, no throw/catch control flow

use thiserror::Error;

/// Error kinds produced by the coordination core and the venue adapters it drives.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Timeout, 5xx, rate-limit — the caller already exhausted its own retry budget.
    #[error("transient venue error on {venue}: {message}")]
    TransientVenue { venue: String, message: String },

    /// Cancel/status query against an order the venue no longer recognizes.
    /// Callers treat this as success and force-clear the local slot.
    #[error("order not found on {venue}: {order_id}")]
    OrderNotFound { venue: String, order_id: String },

    /// An operation would violate a hard invariant (e.g. both legs on the same venue).
    /// Never degrade silently from this — abort the operation and log loudly.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The circuit breaker is open; new-position opens are blocked.
    #[error("circuit breaker open, new positions blocked")]
    CircuitOpen,

    /// Acquiring a lock failed (non-blocking try-acquire semantics).
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// Persisted-state I/O failure (disk, serialization).
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    /// A configuration value failed validation at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
