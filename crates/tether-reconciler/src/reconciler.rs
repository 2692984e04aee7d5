//! Desired-state reconciler.
//!
//! Follows the plugin change feed; for each change, diffs the row's
//! `DesiredState` against the live service set and issues the
//! create/update/remove call that closes the gap. All orchestrator
//! operations are idempotent re-reads of authoritative state, so a
//! crash between steps loses nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use tether_core::{parse_port_spec, Config};
use tether_cluster::{
    ClusterApi, ClusterError, PluginServiceConfig, PortConfig, ServiceSpec, DEFAULT_NETWORK,
};
use tether_store::{
    DesiredState, PluginChange, PluginFilter, PluginPatch, PluginRow, Store,
};

use crate::error::ReconcileError;

/// Port assumed when a plugin row publishes none.
pub const DEFAULT_PLUGIN_PORT: u16 = 5000;

/// Create attempts against a briefly unreachable orchestrator.
const CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFF: Duration = Duration::from_millis(250);

/// Drives the cluster toward each plugin row's `DesiredState`.
pub struct Reconciler {
    store: Store,
    cluster: Arc<dyn ClusterApi>,
    config: Arc<Config>,
}

impl Reconciler {
    pub fn new(store: Store, cluster: Arc<dyn ClusterApi>, config: Arc<Config>) -> Self {
        Self {
            store,
            cluster,
            config,
        }
    }

    /// Start the reconcile loop.
    ///
    /// The change feed is subscribed before this returns, so writes
    /// made after `spawn` are always observed.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> mpsc::Receiver<ReconcileError> {
        let (err_tx, err_rx) = mpsc::channel(16);
        let feed = self.store.plugin_changes();
        tokio::spawn(self.run(feed, err_tx, shutdown));
        err_rx
    }

    async fn run(
        self,
        mut feed: broadcast::Receiver<PluginChange>,
        err_tx: mpsc::Sender<ReconcileError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("reconciler started");
        loop {
            tokio::select! {
                change = feed.recv() => {
                    match change {
                        Ok(change) => {
                            if let Err(e) = self.apply(change).await {
                                warn!(error = %e, "reconcile step failed");
                                let _ = err_tx.send(e).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Rows carry their own desired state, so a
                            // fresh read of any lagged row heals this.
                            warn!(skipped, "change feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("reconciler stopped");
    }

    async fn apply(&self, change: PluginChange) -> Result<(), ReconcileError> {
        let Some(row) = change.new else {
            return Ok(());
        };
        match row.desired_state {
            DesiredState::None => Ok(()),
            DesiredState::Activate => self.activate(&row).await,
            DesiredState::Restart => self.restart(&row).await,
            DesiredState::Stop => self.stop(&row).await,
        }
    }

    /// Bring a plugin up: create its service, or push the current
    /// config to the existing one.
    async fn activate(&self, row: &PluginRow) -> Result<(), ReconcileError> {
        if row.service_name.is_empty() {
            let service_name = format!("{}-{}", row.name, primary_port(row));
            let spec = self.compose(row, &service_name)?;
            let service_id = self.create_with_retry(&spec).await?;

            // Bind the assigned name and handle so later changes and
            // event patches can find this row.
            self.store.update_plugins(
                &PluginFilter::by_name(&row.name),
                &PluginPatch {
                    service_name: Some(service_name.clone()),
                    service_id: Some(service_id),
                    ..PluginPatch::default()
                },
            )?;
            info!(plugin = %row.name, service = %service_name, "service created");
            return Ok(());
        }

        let spec = self.compose(row, &row.service_name)?;
        match self.cluster.inspect_service(&row.service_name).await {
            Ok(_) => {
                self.cluster
                    .update_service(&row.service_name, &spec, false)
                    .await?;
                info!(plugin = %row.name, service = %row.service_name, "service updated");
                Ok(())
            }
            Err(ClusterError::NotFound(_)) => {
                // The row is bound but the service vanished (e.g. the
                // daemon was down when it was removed). Recreate it.
                let service_id = self.create_with_retry(&spec).await?;
                self.store.update_plugins(
                    &PluginFilter::by_name(&row.name),
                    &PluginPatch {
                        service_id: Some(service_id),
                        ..PluginPatch::default()
                    },
                )?;
                info!(plugin = %row.name, service = %row.service_name, "service recreated");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Force a rolling restart of the plugin's service.
    async fn restart(&self, row: &PluginRow) -> Result<(), ReconcileError> {
        if row.service_name.is_empty() {
            return Err(ReconcileError::InvalidConfig {
                plugin: row.name.clone(),
                reason: "restart requested for an unbound plugin".to_string(),
            });
        }
        let spec = self.compose(row, &row.service_name)?;
        self.cluster
            .update_service(&row.service_name, &spec, true)
            .await?;
        info!(plugin = %row.name, service = %row.service_name, "restart issued");
        Ok(())
    }

    /// Remove the plugin's service.
    async fn stop(&self, row: &PluginRow) -> Result<(), ReconcileError> {
        if row.service_id.is_empty() {
            return Err(ReconcileError::InvalidConfig {
                plugin: row.name.clone(),
                reason: "stop requested for an unbound plugin".to_string(),
            });
        }
        match self.cluster.remove_service(&row.service_id).await {
            Ok(()) => {
                info!(plugin = %row.name, service_id = %row.service_id, "service removed");
                Ok(())
            }
            // Already gone: the remove event will settle the row.
            Err(ClusterError::NotFound(_)) => {
                debug!(plugin = %row.name, "service already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compose the orchestrator spec for a row.
    fn compose(
        &self,
        row: &PluginRow,
        service_name: &str,
    ) -> Result<ServiceSpec, ReconcileError> {
        let mut environment = row.environment.clone();
        if !environment.iter().any(|pair| pair.starts_with("PLUGIN=")) {
            environment.push(format!("PLUGIN={}", row.name));
        }

        let config = PluginServiceConfig {
            environment,
            network: DEFAULT_NETWORK.to_string(),
            os: row.os,
            ports: published_ports(row),
            service_name: service_name.to_string(),
            volumes: Vec::new(),
            address: row.address.clone(),
        };
        config
            .build(&self.config.tag)
            .map_err(|e| ReconcileError::InvalidConfig {
                plugin: row.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Create a service, retrying brief unavailability with backoff.
    async fn create_with_retry(&self, spec: &ServiceSpec) -> Result<String, ReconcileError> {
        let mut backoff = CREATE_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.cluster.create_service(spec).await {
                Ok(id) => return Ok(id),
                // The name is taken: adopt the existing service.
                Err(ClusterError::Conflict(_)) => {
                    let existing = self.cluster.inspect_service(&spec.name).await?;
                    return Ok(existing.id);
                }
                Err(ClusterError::Unavailable(reason)) if attempt < CREATE_ATTEMPTS => {
                    warn!(service = %spec.name, attempt, %reason, "create failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The row's primary published port.
fn primary_port(row: &PluginRow) -> u16 {
    row.external_ports
        .first()
        .and_then(|spec| parse_port_spec(spec))
        .map(|(port, _)| port)
        .unwrap_or(DEFAULT_PLUGIN_PORT)
}

/// Published ports from the row, published = target.
fn published_ports(row: &PluginRow) -> Vec<PortConfig> {
    row.external_ports
        .iter()
        .filter_map(|spec| parse_port_spec(spec))
        .map(|(port, protocol)| PortConfig {
            target: port,
            published: port,
            protocol,
        })
        .collect()
}
