//! tetherd — the Tether control-plane daemon.
//!
//! Single binary that assembles the pipelines:
//! - Document store (redb) with change feeds
//! - Orchestrator adapter (engine API client)
//! - Event pipeline (cluster events → plugin rows)
//! - Log pipeline (monitor → tailers → aggregator)
//! - Desired-state reconciler + startup reconciliation
//!
//! Launched with no arguments; all configuration comes from the
//! environment and `manifest.json` in the working directory. Exits 0 on
//! clean shutdown and non-zero when startup fails.

mod supervisor;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_core::fanin::fan_in;
use tether_core::Config;
use tether_cluster::{ClusterApi, EngineClient, EventFilter};
use tether_events::EventPipeline;
use tether_logs::{Aggregator, LogHandler, LogMonitor};
use tether_reconciler::{bootstrap, Reconciler};
use tether_store::Store;

use supervisor::adapt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether control plane starting");
    run(config).await
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    // ── Leaves: store and cluster client ───────────────────────────

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Store::open(&config.data_dir.join("tether.redb"))?;
    info!(path = ?config.data_dir, "store opened");

    let cluster: Arc<dyn ClusterApi> = Arc::new(EngineClient::new(&config.docker_host));
    info!(endpoint = %config.docker_host, "cluster client ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Startup reconciliation (fatal on failure) ──────────────────

    bootstrap::run(&store, &cluster, &config, Path::new("manifest.json")).await?;
    info!("bootstrap complete");

    // ── Steady-state pipelines ─────────────────────────────────────

    // Event pipeline: service events → plugin row patches.
    let (events, event_stream_errs) = cluster
        .events(
            EventFilter::new().with("type", "service"),
            shutdown_rx.clone(),
        )
        .await;
    let (acks, event_errs) = EventPipeline::new(store.clone())
        .spawn(events, shutdown_rx.clone());
    tokio::spawn(supervisor::drain_acks(acks));
    info!("event pipeline started");

    // Log pipeline: monitor → tailers → aggregator.
    let (services, monitor_errs) = LogMonitor::new(cluster.clone())
        .spawn(shutdown_rx.clone());
    let (streams, handler_errs) = LogHandler::new(cluster.clone())
        .spawn(services, shutdown_rx.clone());
    let aggregator_errs = Aggregator::new(store.clone())
        .spawn(streams, shutdown_rx.clone());
    info!("log pipeline started");

    // Desired-state reconciler.
    let reconcile_errs = Reconciler::new(store.clone(), cluster.clone(), config.clone())
        .spawn(shutdown_rx.clone());
    info!("reconciler started");

    // ── Error fan-in + supervisor ──────────────────────────────────

    let merged = fan_in(vec![
        adapt(event_stream_errs),
        adapt(event_errs),
        adapt(monitor_errs),
        adapt(handler_errs),
        adapt(aggregator_errs),
        adapt(reconcile_errs),
    ]);
    let supervisor_handle = tokio::spawn(supervisor::run(merged, shutdown_tx.clone()));

    // ── Shutdown ───────────────────────────────────────────────────

    let mut shutdown_watch = shutdown_rx.clone();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
        _ = shutdown_watch.changed() => {
            info!("supervisor initiated shutdown");
        }
    }

    // Pipelines close their outbound channels on shutdown; the
    // supervisor returns once the merged stream drains.
    let _ = supervisor_handle.await;
    info!("tether control plane stopped");
    Ok(())
}
