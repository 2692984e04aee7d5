//! tether-store — document store for the Tether control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Three tables hold all durable
//! state: `plugins` (one row per logical plugin), `ports` (one row per
//! cluster node), and `logs` (append-only container log lines).
//!
//! # Architecture
//!
//! Rows are JSON-serialized into redb's `&[u8]` value columns, so the
//! documents external UIs read keep their wire field names (`Name`,
//! `ServiceName`, `TCPPorts`, ...). The `Store` is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`) and is shared across pipelines.
//!
//! Mutations go through filter-and-patch primitives rather than blind
//! row overwrites, and every committed plugin write is published on a
//! broadcast change feed in commit order.

pub mod error;
pub mod ports;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::{PluginChange, Store};
pub use types::*;
