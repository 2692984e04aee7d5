//! tether-events — cluster-event ingestor.
//!
//! Consumes the orchestrator's service event stream and reflects each
//! transition into the `plugins` table: create binds and activates,
//! remove stops, update-state transitions track restarts. Every write
//! is a filter-and-patch, so re-delivered events are idempotent.

pub mod classify;
pub mod error;
pub mod pipeline;

pub use classify::{classify, plugin_name_for_service};
pub use error::EventError;
pub use pipeline::{EventPipeline, WriteAck};
