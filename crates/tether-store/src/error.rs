//! Error types for the Tether document store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
///
/// `Unavailable` is the fatal class: the store could not be opened or
/// the backend failed at the transaction level. It is surfaced to the
/// owning pipeline, never retried here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("row already exists: {0}")]
    Duplicate(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("port already allocated: {0}")]
    PortInUse(String),

    #[error("port not allocated: {0}")]
    PortNotFound(String),
}

impl StoreError {
    /// Whether this error means the store as a whole is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Transaction(_)
        )
    }
}
