//! Log pipeline error types.

use thiserror::Error;

use tether_cluster::ClusterError;
use tether_store::StoreError;

/// Errors emitted by the log pipeline stages.
///
/// All variants except `StoreUnavailable` are transient: the pipeline
/// keeps running after emitting them.
#[derive(Debug, Error)]
pub enum LogsError {
    #[error("event subscription failed: {0}")]
    Events(ClusterError),

    #[error("service inspect failed for {service}: {source}")]
    Inspect {
        service: String,
        source: ClusterError,
    },

    #[error("log tail failed for {container}: {source}")]
    Tail {
        container: String,
        source: ClusterError,
    },

    #[error("log row write failed: {0}")]
    Write(StoreError),

    #[error("log store unusable: {0}")]
    StoreUnavailable(StoreError),
}
