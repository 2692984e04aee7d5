//! Event pipeline error types.

use thiserror::Error;

use tether_store::StoreError;

/// Errors emitted by the event pipeline.
///
/// Processing is at-least-once: a failed write is reported and the
/// pipeline moves on, because the next event for the same service
/// supersedes the lost one.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("plugin row update failed for {service}: {source}")]
    Write {
        service: String,
        source: StoreError,
    },
}
