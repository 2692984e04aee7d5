//! tether-core — shared kernel for the Tether control plane.
//!
//! Holds the pieces every other crate needs: the immutable process
//! configuration resolved from the environment, the plugin manifest
//! loader, the OS-family and port-spec types shared between the store
//! and the orchestrator adapter, and the bounded error fan-in used by
//! the supervisor.

pub mod config;
pub mod fanin;
pub mod manifest;
pub mod types;

pub use config::{Config, ConfigError};
pub use manifest::{load_manifest, ManifestError, ManifestPlugin};
pub use types::{format_port_spec, parse_port_spec, OsFamily, Protocol};
