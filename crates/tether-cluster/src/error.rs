//! Orchestrator adapter error types.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur against the cluster API.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The orchestrator endpoint could not be reached.
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    /// The service configuration was rejected before reaching the wire.
    #[error("invalid service config: {0}")]
    InvalidConfig(String),

    /// The requested container image does not exist.
    #[error("image missing: {0}")]
    ImageMissing(String),

    /// No service or node matched the given id or name.
    #[error("not found: {0}")]
    NotFound(String),

    /// A service with the same name already exists.
    #[error("name conflict: {0}")]
    Conflict(String),

    /// A log tail could not be opened or broke mid-stream.
    #[error("log tail failed for {0}")]
    TailFailed(String),

    /// The API answered with an unexpected status or body.
    #[error("api error: {0}")]
    Api(String),

    /// The API answered with a body we could not decode.
    #[error("decode error: {0}")]
    Decode(String),
}
