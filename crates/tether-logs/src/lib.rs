//! tether-logs — log aggregation pipeline.
//!
//! Three long-lived stages wired by channels:
//!
//! 1. [`LogMonitor`] emits each non-stack service exactly once — the
//!    current set at startup, then new ones as create events arrive.
//! 2. [`LogHandler`] opens a tailer per service container and emits a
//!    channel of parsed log lines per tailer (a channel of channels).
//! 3. [`Aggregator`] consumes the dynamic set of line channels and
//!    writes every line into the `logs` table.
//!
//! Ordering within one container's stream is preserved (one writer task
//! per tailer); ordering across containers is not.

pub mod aggregator;
pub mod error;
pub mod handler;
pub mod monitor;

pub use aggregator::Aggregator;
pub use error::LogsError;
pub use handler::{LogHandler, LogStream};
pub use monitor::LogMonitor;
