//! Log monitor — emits every tailable service exactly once.
//!
//! On startup the monitor sweeps the current service list, then follows
//! service-create events. Services that belong to a stack namespace are
//! never emitted; the bundle's own controller owns those.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use tether_cluster::{ClusterApi, EventFilter, ServiceDesc};

use crate::error::LogsError;

/// Emits descriptors of services whose containers should be tailed.
pub struct LogMonitor {
    cluster: Arc<dyn ClusterApi>,
}

impl LogMonitor {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Start the monitor task.
    ///
    /// Returns the descriptor stream and the monitor's error stream.
    /// Both close when the shutdown channel flips.
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<ServiceDesc>, mpsc::Receiver<LogsError>) {
        let (svc_tx, svc_rx) = mpsc::channel(16);
        let (err_tx, err_rx) = mpsc::channel(16);
        tokio::spawn(self.run(svc_tx, err_tx, shutdown));
        (svc_rx, err_rx)
    }

    async fn run(
        self,
        svc_tx: mpsc::Sender<ServiceDesc>,
        err_tx: mpsc::Sender<LogsError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Subscribe before the initial sweep so services created during
        // the sweep are not missed; the seen set absorbs the overlap.
        let filter = EventFilter::new()
            .with("type", "service")
            .with("event", "create");
        let (mut events, mut event_errs) =
            self.cluster.events(filter, shutdown.clone()).await;

        let mut seen: HashSet<String> = HashSet::new();

        match self.cluster.list_services().await {
            Ok(services) => {
                for service in services {
                    if service.in_stack_namespace() || !seen.insert(service.id.clone()) {
                        continue;
                    }
                    if let Some(desc) = self.resolve(&service.id, &err_tx).await {
                        if svc_tx.send(desc).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = err_tx.send(LogsError::Events(e)).await;
            }
        }
        info!(services = seen.len(), "log monitor initial sweep complete");

        let mut errs_open = true;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let id = event.actor.id;
                    if id.is_empty() || !seen.insert(id.clone()) {
                        continue;
                    }
                    if let Some(desc) = self.resolve(&id, &err_tx).await {
                        debug!(service = %desc.name, "new service tailable");
                        if svc_tx.send(desc).await.is_err() {
                            return;
                        }
                    }
                }
                err = event_errs.recv(), if errs_open => {
                    match err {
                        Some(e) => {
                            let _ = err_tx.send(LogsError::Events(e)).await;
                        }
                        None => errs_open = false,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("log monitor stopped");
    }

    /// Inspect a service; on failure forward the error and skip it.
    async fn resolve(
        &self,
        id: &str,
        err_tx: &mpsc::Sender<LogsError>,
    ) -> Option<ServiceDesc> {
        match self.cluster.inspect_service(id).await {
            Ok(desc) if desc.in_stack_namespace() => None,
            Ok(desc) => Some(desc),
            Err(source) => {
                let _ = err_tx
                    .send(LogsError::Inspect {
                        service: id.to_string(),
                        source,
                    })
                    .await;
                None
            }
        }
    }
}
