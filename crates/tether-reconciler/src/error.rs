//! Reconciler error types.

use thiserror::Error;

use tether_cluster::ClusterError;
use tether_store::StoreError;

/// Errors emitted by the desired-state loop.
///
/// `InvalidConfig` drops the change and is never retried; cluster and
/// store errors are surfaced for the supervisor to judge.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid config for plugin {plugin}: {reason}")]
    InvalidConfig { plugin: String, reason: String },

    #[error("cluster call failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
}
