//! tether-reconciler — keeps the cluster in agreement with desired state.
//!
//! The [`Reconciler`] follows the plugin change feed and turns
//! `DesiredState` transitions into orchestrator calls; [`bootstrap`]
//! runs the ordered boot sequence that seeds the node and plugin
//! catalogs and re-adopts services that were already running.
//!
//! The reconciler never clears `DesiredState` itself: the event
//! pipeline does that once it observes the corresponding orchestrator
//! transition, so a row only ever reads "done" after the cluster
//! actually acted.

pub mod bootstrap;
pub mod error;
pub mod reconciler;

pub use bootstrap::BootstrapError;
pub use error::ReconcileError;
pub use reconciler::Reconciler;
