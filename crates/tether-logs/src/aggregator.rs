//! Aggregator — fan-in of per-container line channels into the store.
//!
//! One writer task per inner stream: the set of tailed containers grows
//! and shrinks dynamically, and within one container the insert order
//! matches the line order. Empty lines are dropped; a failed row write
//! is reported and the stream continues; an unusable store ends that
//! writer.

use tokio::sync::{mpsc, watch};
use tracing::debug;

use tether_store::Store;

use crate::error::LogsError;
use crate::handler::LogStream;

/// Writes every log line from a dynamic set of streams into the store.
pub struct Aggregator {
    store: Store,
}

impl Aggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Start the aggregator over a channel of line channels.
    ///
    /// Returns the aggregator's error stream; it closes once the outer
    /// channel closes and every writer has finished.
    pub fn spawn(
        self,
        mut streams: mpsc::Receiver<LogStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<LogsError> {
        let (err_tx, err_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = streams.recv() => {
                        let Some(stream) = stream else { break };
                        tokio::spawn(write_stream(
                            self.store.clone(),
                            stream,
                            err_tx.clone(),
                        ));
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("aggregator stopped");
        });

        err_rx
    }
}

/// Drain one container's lines into the store.
async fn write_stream(
    store: Store,
    mut lines: LogStream,
    err_tx: mpsc::Sender<LogsError>,
) {
    while let Some(entry) = lines.recv().await {
        if entry.msg.trim().is_empty() {
            continue;
        }
        match store.insert_log(entry) {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                let _ = err_tx.send(LogsError::StoreUnavailable(e)).await;
                return;
            }
            Err(e) => {
                let _ = err_tx.send(LogsError::Write(e)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_store::LogEntry;

    fn entry(container: &str, msg: &str) -> LogEntry {
        LogEntry {
            container_id: container.to_string(),
            container_name: container.to_string(),
            msg: msg.to_string(),
            source_service_name: format!("{container}-svc"),
            rt: 0,
        }
    }

    async fn feed(
        tx: mpsc::Sender<LogStream>,
        container: &'static str,
        count: usize,
    ) -> tokio::task::JoinHandle<()> {
        let (line_tx, line_rx) = mpsc::channel(1);
        tx.send(line_rx).await.unwrap();
        tokio::spawn(async move {
            for i in 0..count {
                line_tx.send(entry(container, &format!("line {i}"))).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn two_containers_fan_in_with_per_container_order() {
        let store = Store::open_in_memory().unwrap();
        let (stream_tx, stream_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let mut errors = Aggregator::new(store.clone()).spawn(stream_rx, shutdown);

        let a = feed(stream_tx.clone(), "ctr-a", 100).await;
        let b = feed(stream_tx.clone(), "ctr-b", 100).await;
        a.await.unwrap();
        b.await.unwrap();
        drop(stream_tx);

        // Writers are done once the error stream closes.
        assert!(errors.recv().await.is_none());

        let logs = store.list_logs().unwrap();
        assert_eq!(logs.len(), 200);

        for container in ["ctr-a", "ctr-b"] {
            let rows: Vec<_> = logs
                .iter()
                .filter(|l| l.container_id == container)
                .collect();
            assert_eq!(rows.len(), 100);
            // Per-container insertion order matches line order, and the
            // stamped times never go backwards.
            for (i, row) in rows.iter().enumerate() {
                assert_eq!(row.msg, format!("line {i}"));
            }
            for window in rows.windows(2) {
                assert!(window[1].rt >= window[0].rt);
            }
        }
    }

    #[tokio::test]
    async fn empty_lines_are_dropped() {
        let store = Store::open_in_memory().unwrap();
        let (stream_tx, stream_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let mut errors = Aggregator::new(store.clone()).spawn(stream_rx, shutdown);

        let (line_tx, line_rx) = mpsc::channel(1);
        stream_tx.send(line_rx).await.unwrap();
        drop(stream_tx);

        line_tx.send(entry("ctr-a", "kept")).await.unwrap();
        line_tx.send(entry("ctr-a", "")).await.unwrap();
        line_tx.send(entry("ctr-a", "   ")).await.unwrap();
        line_tx.send(entry("ctr-a", "also kept")).await.unwrap();
        drop(line_tx);

        assert!(errors.recv().await.is_none());

        let logs = store.list_logs().unwrap();
        let msgs: Vec<_> = logs.iter().map(|l| l.msg.as_str()).collect();
        assert_eq!(msgs, vec!["kept", "also kept"]);
    }

    #[tokio::test]
    async fn streams_added_while_running_are_consumed() {
        let store = Store::open_in_memory().unwrap();
        let (stream_tx, stream_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let mut errors = Aggregator::new(store.clone()).spawn(stream_rx, shutdown);

        feed(stream_tx.clone(), "ctr-a", 5).await.await.unwrap();
        // A later arrival joins the set.
        feed(stream_tx.clone(), "ctr-b", 5).await.await.unwrap();
        drop(stream_tx);

        assert!(errors.recv().await.is_none());
        assert_eq!(store.list_logs().unwrap().len(), 10);
    }
}
