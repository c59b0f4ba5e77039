//! Store error types.

use thiserror::Error;

/// Store error type.
///
/// Every failure of the storage engine or the message store crosses the
/// component boundary as one of these variants; the raw engine error never
/// escapes unwrapped. [`StoreError::engine_code`] exposes the underlying
/// engine result code for callers that key retry policy on it.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Input rejected before any I/O was attempted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Configuration rejected or a configuration apply aborted.
    #[error("configuration rejected: {0}")]
    Configuration(String),

    /// The manager has no usable store and the call failed fast.
    #[error("storage engine not ready: {0}")]
    NotReady(String),

    /// Engine error reported by the embedded database.
    #[error("storage engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    /// Pool checkout or connection establishment failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Live row count saturates the 32-bit id space.
    #[error("store is full")]
    CapacityExhausted,

    /// Filesystem error while opening or recreating a store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A wait on the scheduler, the lock, or a worker was cut short.
    #[error("interrupted while waiting on the storage engine: {0}")]
    Interrupted(String),
}

impl StoreError {
    /// The extended result code of the underlying engine error, if any.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            StoreError::Engine(rusqlite::Error::SqliteFailure(e, _)) => Some(e.extended_code),
            _ => None,
        }
    }
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
