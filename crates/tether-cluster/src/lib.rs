//! tether-cluster — adapter over the container orchestrator.
//!
//! Every call the control plane makes against the cluster API goes
//! through the [`ClusterApi`] capability trait: list nodes, list and
//! mutate services, subscribe to the event stream, tail container logs.
//! `EngineClient` implements it against the engine's HTTP API;
//! `MockCluster` (feature `mock`) implements it in memory for tests.

pub mod api;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod spec;

pub use api::{
    ClusterApi, EventActor, EventFilter, EventRecord, NodeDesc, PortConfig, ServiceDesc,
};
pub use engine::EngineClient;
pub use error::{ClusterError, ClusterResult};
#[cfg(any(test, feature = "mock"))]
pub use mock::MockCluster;
pub use spec::{
    PluginServiceConfig, ServiceSpec, VolumeMount, DEFAULT_NETWORK, STACK_NAMESPACE_LABEL,
};
