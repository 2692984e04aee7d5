//! Log handler — one tailer per service container.
//!
//! For each incoming service descriptor the handler opens a follow
//! tail against its container, parses the byte stream into log lines,
//! and emits the per-container line channel on the outer channel.
//!
//! Inner channels are capacity-1: if the aggregator stops reading, the
//! tailer blocks rather than buffering without bound.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use tether_cluster::{ClusterApi, ServiceDesc};
use tether_store::LogEntry;

use crate::error::LogsError;

/// A single container's parsed log lines.
pub type LogStream = mpsc::Receiver<LogEntry>;

/// Opens tailers and emits a channel of line channels.
pub struct LogHandler {
    cluster: Arc<dyn ClusterApi>,
}

impl LogHandler {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Start the handler task over a stream of service descriptors.
    pub fn spawn(
        self,
        mut services: mpsc::Receiver<ServiceDesc>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<LogStream>, mpsc::Receiver<LogsError>) {
        let (stream_tx, stream_rx) = mpsc::channel(16);
        let (err_tx, err_rx) = mpsc::channel(16);

        let mut outer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    service = services.recv() => {
                        let Some(service) = service else { break };
                        if service.container_id.is_empty() {
                            debug!(service = %service.name, "no container yet, skipping tail");
                            continue;
                        }
                        let (line_tx, line_rx) = mpsc::channel(1);
                        if stream_tx.send(line_rx).await.is_err() {
                            break;
                        }
                        tokio::spawn(tail_container(
                            self.cluster.clone(),
                            service,
                            line_tx,
                            err_tx.clone(),
                            shutdown.clone(),
                        ));
                    }
                    _ = outer_shutdown.changed() => break,
                }
            }
            debug!("log handler stopped");
        });

        (stream_rx, err_rx)
    }
}

/// Tail one container until it exits or shutdown flips.
async fn tail_container(
    cluster: Arc<dyn ClusterApi>,
    service: ServiceDesc,
    line_tx: mpsc::Sender<LogEntry>,
    err_tx: mpsc::Sender<LogsError>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut chunks, mut tail_errs) = cluster
        .container_logs(&service.container_id, shutdown.clone())
        .await;

    let mut pending = String::new();
    let mut errs_open = true;
    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                match chunk {
                    Some(bytes) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            let entry = parse_line(&service, line.trim_end_matches(['\n', '\r']));
                            // Blocking send: intentional backpressure.
                            if line_tx.send(entry).await.is_err() {
                                return;
                            }
                        }
                    }
                    // Container exited.
                    None => break,
                }
            }
            err = tail_errs.recv(), if errs_open => {
                match err {
                    Some(source) => {
                        let _ = err_tx
                            .send(LogsError::Tail {
                                container: service.container_id.clone(),
                                source,
                            })
                            .await;
                        break;
                    }
                    None => errs_open = false,
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(container = %service.container_id, "tail closed");
    // Dropping line_tx closes this container's stream.
}

/// Build a log entry from one raw line.
///
/// The tail is opened with timestamps enabled, so each line starts with
/// an RFC 3339 stamp; it is stripped here, the insert stamps its own.
fn parse_line(service: &ServiceDesc, line: &str) -> LogEntry {
    LogEntry {
        container_id: service.container_id.clone(),
        container_name: service.name.clone(),
        msg: strip_timestamp(line).to_string(),
        source_service_name: service.name.clone(),
        rt: 0,
    }
}

fn strip_timestamp(line: &str) -> &str {
    if let Some((first, rest)) = line.split_once(' ') {
        let looks_like_stamp = first.len() >= 20
            && first.as_bytes()[..4].iter().all(u8::is_ascii_digit)
            && first.contains('T')
            && (first.ends_with('Z') || first.contains('+'));
        if looks_like_stamp {
            return rest;
        }
    }
    line
}
