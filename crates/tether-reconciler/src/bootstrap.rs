//! Startup reconciliation.
//!
//! Four ordered steps, each under its own wall-clock budget:
//!
//! 1. advertise the cluster's nodes as port rows,
//! 2. seed the plugin catalog from the manifest,
//! 3. re-adopt services that are already running,
//! 4. optionally create the two well-known services.
//!
//! Any failure aborts startup; the surrounding orchestrator restarts
//! the daemon.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use tether_core::{format_port_spec, load_manifest, Config, ManifestError, OsFamily, Protocol};
use tether_cluster::{
    ClusterApi, ClusterError, PluginServiceConfig, PortConfig, ServiceDesc, DEFAULT_NETWORK,
};
use tether_store::{
    DesiredState, PluginFilter, PluginPatch, PluginRow, PluginState, PortRow, Store, StoreError,
};

/// Wall-clock budget per bootstrap step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Reserved harness service name.
pub const HARNESS_SERVICE: &str = "Harness-5000";

/// Reserved auxiliary service name.
pub const AUX_SERVICE: &str = "AuxiliaryServices";

/// Fatal bootstrap failures.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("cluster reports no nodes")]
    NoNodes,

    #[error("empty plugin manifest: {0}")]
    EmptyManifest(String),

    #[error("manifest error: {0}")]
    Manifest(ManifestError),

    #[error("bootstrap step '{0}' exceeded its time budget")]
    Timeout(&'static str),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

/// Run the full boot sequence. Each step must complete before the next
/// starts.
pub async fn run(
    store: &Store,
    cluster: &Arc<dyn ClusterApi>,
    config: &Config,
    manifest_path: &Path,
) -> Result<(), BootstrapError> {
    step("advertise-nodes", advertise_nodes(store, cluster)).await?;
    info!("nodes advertised");

    step("advertise-plugins", advertise_plugins(store, manifest_path)).await?;
    info!("plugin catalog seeded");

    step(
        "startup-service-status",
        startup_service_status(store, cluster),
    )
    .await?;
    info!("running services re-adopted");

    step("startup-services", startup_services(cluster, config)).await?;
    info!("startup services ensured");

    Ok(())
}

async fn step<F>(name: &'static str, fut: F) -> Result<(), BootstrapError>
where
    F: Future<Output = Result<(), BootstrapError>>,
{
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(BootstrapError::Timeout(name)),
    }
}

/// Step 1: one port row per cluster node.
///
/// Re-running preserves already-allocated ports; only the node identity
/// fields are refreshed.
pub async fn advertise_nodes(
    store: &Store,
    cluster: &Arc<dyn ClusterApi>,
) -> Result<(), BootstrapError> {
    let nodes = cluster.list_nodes().await?;
    if nodes.is_empty() {
        return Err(BootstrapError::NoNodes);
    }

    for node in nodes {
        let existing = store.get_port_row(&node.address)?;
        let (tcp_ports, udp_ports) = existing
            .map(|row| (row.tcp_ports, row.udp_ports))
            .unwrap_or_default();
        store.upsert_port_row(&PortRow {
            address: node.address.clone(),
            node_host_name: node.hostname.clone(),
            os: OsFamily::from_node_os(&node.os),
            tcp_ports,
            udp_ports,
        })?;
        debug!(address = %node.address, hostname = %node.hostname, "node advertised");
    }
    Ok(())
}

/// Step 2: seed the plugin catalog from the manifest.
pub async fn advertise_plugins(
    store: &Store,
    manifest_path: &Path,
) -> Result<(), BootstrapError> {
    let plugins = load_manifest(manifest_path).map_err(|e| match e {
        ManifestError::Empty(path) => BootstrapError::EmptyManifest(path),
        other => BootstrapError::Manifest(other),
    })?;

    for plugin in plugins {
        if store.get_plugin(&plugin.name)?.is_some() {
            continue;
        }
        store.insert_plugin(&PluginRow::available(&plugin.name, plugin.os))?;
        debug!(name = %plugin.name, "plugin row seeded");
    }
    Ok(())
}

/// Step 3: fold already-running services back into the catalog.
pub async fn startup_service_status(
    store: &Store,
    cluster: &Arc<dyn ClusterApi>,
) -> Result<(), BootstrapError> {
    for service in cluster.list_services().await? {
        if service.in_stack_namespace() {
            continue;
        }
        let entry = service_to_entry(store, &service)?;
        if store.get_plugin(&entry.name)?.is_some() {
            store.update_plugins(
                &PluginFilter::by_name(&entry.name),
                &PluginPatch {
                    state: Some(PluginState::Active),
                    desired_state: Some(DesiredState::None),
                    service_name: Some(entry.service_name.clone()),
                    service_id: Some(entry.service_id.clone()),
                    external_ports: Some(entry.external_ports.clone()),
                    internal_ports: Some(entry.internal_ports.clone()),
                    ..PluginPatch::default()
                },
            )?;
        } else {
            store.insert_plugin(&entry)?;
        }
        debug!(service = %service.name, plugin = %entry.name, "service re-adopted");
    }
    Ok(())
}

/// Synthesize a plugin row from a running service.
///
/// The name comes from the service's `PLUGIN` environment variable; the
/// reserved `AuxiliaryServices` service maps to `AuxServices`. The OS
/// is inherited from an existing row of the same name when present.
pub fn service_to_entry(store: &Store, service: &ServiceDesc) -> Result<PluginRow, StoreError> {
    let name = if service.name == AUX_SERVICE {
        "AuxServices".to_string()
    } else {
        service
            .env_var("PLUGIN")
            .unwrap_or(&service.name)
            .to_string()
    };

    let os = store
        .get_plugin(&name)?
        .map(|row| row.os)
        .unwrap_or(OsFamily::Posix);

    Ok(PluginRow {
        name,
        service_name: service.name.clone(),
        service_id: service.id.clone(),
        desired_state: DesiredState::None,
        state: PluginState::Active,
        os,
        address: String::new(),
        external_ports: service
            .ports
            .iter()
            .map(|p| format_port_spec(p.published, p.protocol))
            .collect(),
        internal_ports: service
            .ports
            .iter()
            .map(|p| format_port_spec(p.target, p.protocol))
            .collect(),
        environment: service.env.clone(),
    })
}

/// Step 4: create the well-known services, each behind its own flag.
pub async fn startup_services(
    cluster: &Arc<dyn ClusterApi>,
    config: &Config,
) -> Result<(), BootstrapError> {
    if config.start_harness {
        ensure_service(cluster, config, harness_config()).await?;
    }
    if config.start_aux {
        ensure_service(cluster, config, aux_config()).await?;
    }
    Ok(())
}

async fn ensure_service(
    cluster: &Arc<dyn ClusterApi>,
    config: &Config,
    service: PluginServiceConfig,
) -> Result<(), BootstrapError> {
    let spec = service.build(&config.tag)?;
    match cluster.create_service(&spec).await {
        Ok(id) => {
            info!(service = %spec.name, %id, "startup service created");
            Ok(())
        }
        Err(ClusterError::Conflict(_)) => {
            debug!(service = %spec.name, "startup service already running");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn harness_config() -> PluginServiceConfig {
    PluginServiceConfig {
        environment: vec!["PLUGIN=Harness".to_string()],
        network: DEFAULT_NETWORK.to_string(),
        os: OsFamily::All,
        ports: vec![PortConfig {
            target: 5000,
            published: 5000,
            protocol: Protocol::Tcp,
        }],
        service_name: HARNESS_SERVICE.to_string(),
        volumes: Vec::new(),
        address: String::new(),
    }
}

fn aux_config() -> PluginServiceConfig {
    PluginServiceConfig {
        environment: vec!["PLUGIN=AuxServices".to_string()],
        network: DEFAULT_NETWORK.to_string(),
        os: OsFamily::All,
        ports: Vec::new(),
        service_name: AUX_SERVICE.to_string(),
        volumes: Vec::new(),
        address: String::new(),
    }
}
