//! The cluster capability surface.
//!
//! Pipelines depend on this trait, never on a concrete client, so every
//! pipeline runs unchanged against the in-memory mock in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use tether_core::Protocol;

use crate::error::{ClusterError, ClusterResult};
use crate::spec::ServiceSpec;

/// A worker node as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDesc {
    pub id: String,
    pub hostname: String,
    /// Node-facing IP address.
    pub address: String,
    /// Raw platform OS string (`linux`, `windows`, ...).
    pub os: String,
}

/// One published port of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    pub target: u16,
    pub published: u16,
    pub protocol: Protocol,
}

/// A running service as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceDesc {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// `KEY=VALUE` pairs from the container spec.
    pub env: Vec<String>,
    pub ports: Vec<PortConfig>,
    /// Container backing the service's task; empty when no task is
    /// running yet.
    pub container_id: String,
}

impl ServiceDesc {
    /// Whether this service belongs to a deployment bundle the control
    /// plane must not fight over.
    pub fn in_stack_namespace(&self) -> bool {
        self.labels.contains_key(crate::spec::STACK_NAMESPACE_LABEL)
    }

    /// Value of an environment variable in the container spec.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|pair| {
            pair.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// One record from the orchestrator event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventRecord {
    #[serde(rename = "Type")]
    pub typ: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor")]
    pub actor: EventActor,
}

/// The object an event concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventActor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Attributes")]
    pub attributes: HashMap<String, String>,
}

/// Event subscription filter: values under the same key are OR'd,
/// distinct keys are AND'd.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    entries: Vec<(String, String)>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.entries.push((key.to_string(), value.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate the filter against an event.
    ///
    /// Supported keys are `type` (the event type) and `event` (the
    /// action); unknown keys never match, mirroring the engine.
    pub fn matches(&self, event: &EventRecord) -> bool {
        let mut keys: Vec<&str> = self.entries.iter().map(|(k, _)| k.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();

        for key in keys {
            let actual = match key {
                "type" => event.typ.as_str(),
                "event" => event.action.as_str(),
                _ => return false,
            };
            let any = self
                .entries
                .iter()
                .filter(|(k, _)| k == key)
                .any(|(_, v)| v == actual);
            if !any {
                return false;
            }
        }
        true
    }

    /// Render the filter as the engine's `filters` query value.
    pub fn to_query_json(&self) -> String {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for (key, value) in &self.entries {
            map.entry(key.as_str()).or_default().push(value.as_str());
        }
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Capability surface over the container orchestrator.
///
/// Streaming methods take the root shutdown channel; both returned
/// streams close when it flips or the upstream connection ends.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> ClusterResult<Vec<NodeDesc>>;

    async fn list_services(&self) -> ClusterResult<Vec<ServiceDesc>>;

    async fn inspect_service(&self, id_or_name: &str) -> ClusterResult<ServiceDesc>;

    /// Create a service; returns the orchestrator-assigned id.
    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<String>;

    /// Update a service in place. `force` restarts the tasks even when
    /// the spec is unchanged.
    async fn update_service(
        &self,
        id_or_name: &str,
        spec: &ServiceSpec,
        force: bool,
    ) -> ClusterResult<()>;

    async fn remove_service(&self, id: &str) -> ClusterResult<()>;

    /// Subscribe to the event stream.
    async fn events(
        &self,
        filter: EventFilter,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<EventRecord>, mpsc::Receiver<ClusterError>);

    /// Tail a container's stdout+stderr with timestamps, following
    /// until the container exits.
    async fn container_logs(
        &self,
        container_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<Bytes>, mpsc::Receiver<ClusterError>);
}
