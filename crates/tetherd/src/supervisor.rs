//! Supervisor — consumes the merged pipeline error stream.
//!
//! Every error is logged; fatal classes flip the root shutdown channel
//! and the surrounding orchestrator restarts the whole daemon. There is
//! no in-process restart.

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use tether_cluster::ClusterError;
use tether_events::{EventError, WriteAck};
use tether_logs::LogsError;
use tether_reconciler::ReconcileError;
use tether_store::StoreError;

/// Union of every pipeline's error stream.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("logs: {0}")]
    Logs(#[from] LogsError),

    #[error("events: {0}")]
    Events(#[from] EventError),

    #[error("reconcile: {0}")]
    Reconcile(#[from] ReconcileError),
}

impl PipelineError {
    /// Whether the daemon cannot usefully continue.
    ///
    /// Pipelines cannot function without the store, and an unreachable
    /// orchestrator that survived in-pipeline retries means the same.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_fatal(),
            PipelineError::Cluster(ClusterError::Unavailable(_)) => true,
            PipelineError::Logs(LogsError::StoreUnavailable(_)) => true,
            PipelineError::Logs(LogsError::Events(ClusterError::Unavailable(_))) => true,
            PipelineError::Events(EventError::Write { source, .. }) => source.is_fatal(),
            PipelineError::Reconcile(ReconcileError::Store(e)) => e.is_fatal(),
            PipelineError::Reconcile(ReconcileError::Cluster(ClusterError::Unavailable(_))) => {
                true
            }
            _ => false,
        }
    }
}

/// Map a typed error stream into the process-wide one.
pub fn adapt<E>(mut source: mpsc::Receiver<E>) -> mpsc::Receiver<PipelineError>
where
    E: Send + 'static,
    PipelineError: From<E>,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(err) = source.recv().await {
            if tx.send(PipelineError::from(err)).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Log the event pipeline's acknowledgements at debug level.
pub async fn drain_acks(mut acks: mpsc::Receiver<WriteAck>) {
    while let Some(ack) = acks.recv().await {
        debug!(service = %ack.service_name, modified = ack.modified, "event acknowledged");
    }
}

/// Consume the merged error stream until it closes or a fatal error
/// flips the shutdown channel.
pub async fn run(mut merged: mpsc::Receiver<PipelineError>, shutdown: watch::Sender<bool>) {
    while let Some(err) = merged.recv().await {
        if err.is_fatal() {
            error!(error = %err, "fatal pipeline error, shutting down");
            let _ = shutdown.send(true);
        } else {
            warn!(error = %err, "pipeline error");
        }
    }
    debug!("all pipeline error streams closed");
}
