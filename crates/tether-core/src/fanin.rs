//! Bounded fan-in of pipeline error streams.
//!
//! Every pipeline exposes a receive-only error stream; the supervisor
//! wants exactly one. `fan_in` forwards each upstream into a single
//! bounded channel: one forwarder task per upstream, closing the merged
//! stream once every upstream has closed. Sends block when the consumer
//! is slow, so nothing is dropped.

use tokio::sync::mpsc;

/// Capacity of the merged channel.
const MERGED_CAPACITY: usize = 64;

/// Merge a set of receivers into one bounded stream.
///
/// The returned receiver closes after every source has closed.
pub fn fan_in<T: Send + 'static>(sources: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(MERGED_CAPACITY);
    for mut source in sources {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = source.recv().await {
                if tx.send(item).await.is_err() {
                    // Merged consumer is gone; stop forwarding.
                    break;
                }
            }
        });
    }
    rx
}
