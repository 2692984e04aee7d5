//! In-memory cluster for tests.
//!
//! Behaves like a tiny single-manager cluster: services are rows in a
//! vector, mutations emit the same event shapes the engine would, and
//! container logs replay pre-loaded frames then close (the container
//! "exits").

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};

use crate::api::*;
use crate::error::{ClusterError, ClusterResult};
use crate::spec::ServiceSpec;

struct MockState {
    nodes: Vec<NodeDesc>,
    services: Vec<ServiceDesc>,
    /// Pre-loaded log payloads per container id.
    logs: HashMap<String, Vec<Bytes>>,
    next_id: u64,
}

/// An in-memory [`ClusterApi`] implementation.
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<EventRecord>,
}

impl MockCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(MockState {
                nodes: Vec::new(),
                services: Vec::new(),
                logs: HashMap::new(),
                next_id: 0,
            })),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker node.
    pub fn add_node(&self, address: &str, hostname: &str, os: &str) {
        let mut state = self.lock();
        let id = format!("node-{}", state.nodes.len() + 1);
        state.nodes.push(NodeDesc {
            id,
            hostname: hostname.to_string(),
            address: address.to_string(),
            os: os.to_string(),
        });
    }

    /// Register an already-running service (for re-adoption tests).
    pub fn add_service(&self, desc: ServiceDesc) {
        self.lock().services.push(desc);
    }

    /// Pre-load the log frames a container will replay.
    pub fn set_container_logs(&self, container_id: &str, lines: &[&str]) {
        let frames = lines
            .iter()
            .map(|line| Bytes::from(format!("{line}\n")))
            .collect();
        self.lock().logs.insert(container_id.to_string(), frames);
    }

    /// Inject a raw event into the stream.
    pub fn push_event(&self, event: EventRecord) {
        let _ = self.events.send(event);
    }

    /// Snapshot of the current service set.
    pub fn services(&self) -> Vec<ServiceDesc> {
        self.lock().services.clone()
    }

    /// Find a service by name.
    pub fn service_named(&self, name: &str) -> Option<ServiceDesc> {
        self.lock().services.iter().find(|s| s.name == name).cloned()
    }

    fn service_event(action: &str, id: &str, name: &str) -> EventRecord {
        EventRecord {
            typ: "service".to_string(),
            action: action.to_string(),
            actor: EventActor {
                id: id.to_string(),
                attributes: HashMap::from([("name".to_string(), name.to_string())]),
            },
        }
    }

    fn update_state_event(id: &str, name: &str, new_state: &str) -> EventRecord {
        let mut event = Self::service_event("update", id, name);
        event
            .actor
            .attributes
            .insert("updatestate.new".to_string(), new_state.to_string());
        event
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn list_nodes(&self) -> ClusterResult<Vec<NodeDesc>> {
        Ok(self.lock().nodes.clone())
    }

    async fn list_services(&self) -> ClusterResult<Vec<ServiceDesc>> {
        Ok(self.lock().services.clone())
    }

    async fn inspect_service(&self, id_or_name: &str) -> ClusterResult<ServiceDesc> {
        self.lock()
            .services
            .iter()
            .find(|s| s.id == id_or_name || s.name == id_or_name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(id_or_name.to_string()))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<String> {
        let (id, event) = {
            let mut state = self.lock();
            if state.services.iter().any(|s| s.name == spec.name) {
                return Err(ClusterError::Conflict(spec.name.clone()));
            }
            state.next_id += 1;
            let id = format!("svc-{}", state.next_id);
            let container_id = format!("ctr-{}", state.next_id);
            state.services.push(ServiceDesc {
                id: id.clone(),
                name: spec.name.clone(),
                labels: HashMap::new(),
                env: spec.env.clone(),
                ports: spec.ports.clone(),
                container_id,
            });
            (id.clone(), Self::service_event("create", &id, &spec.name))
        };
        let _ = self.events.send(event);
        Ok(id)
    }

    async fn update_service(
        &self,
        id_or_name: &str,
        spec: &ServiceSpec,
        _force: bool,
    ) -> ClusterResult<()> {
        let (id, name) = {
            let mut state = self.lock();
            let service = state
                .services
                .iter_mut()
                .find(|s| s.id == id_or_name || s.name == id_or_name)
                .ok_or_else(|| ClusterError::NotFound(id_or_name.to_string()))?;
            service.env = spec.env.clone();
            service.ports = spec.ports.clone();
            (service.id.clone(), service.name.clone())
        };
        // The rolling update starts, then converges.
        let _ = self.events.send(Self::update_state_event(&id, &name, "updating"));
        let _ = self
            .events
            .send(Self::update_state_event(&id, &name, "completed"));
        Ok(())
    }

    async fn remove_service(&self, id: &str) -> ClusterResult<()> {
        let event = {
            let mut state = self.lock();
            let index = state
                .services
                .iter()
                .position(|s| s.id == id || s.name == id)
                .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
            let service = state.services.remove(index);
            Self::service_event("remove", &service.id, &service.name)
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn events(
        &self,
        filter: EventFilter,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<EventRecord>, mpsc::Receiver<ClusterError>) {
        let (tx, rx) = mpsc::channel(64);
        let (_err_tx, err_rx) = mpsc::channel(8);
        let mut feed = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = feed.recv() => {
                        match event {
                            Ok(event) if filter.matches(&event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        (rx, err_rx)
    }

    async fn container_logs(
        &self,
        container_id: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<Bytes>, mpsc::Receiver<ClusterError>) {
        let (tx, rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let frames = self.lock().logs.get(container_id).cloned();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            let Some(frames) = frames else {
                let _ = err_tx
                    .send(ClusterError::TailFailed(container_id))
                    .await;
                return;
            };
            for frame in frames {
                tokio::select! {
                    sent = tx.send(frame) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
            // Dropping tx closes the stream: the container has exited.
        });
        (rx, err_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{PluginServiceConfig, DEFAULT_NETWORK};
    use tether_core::OsFamily;

    fn spec(name: &str) -> ServiceSpec {
        PluginServiceConfig {
            environment: vec![format!("PLUGIN={name}")],
            network: DEFAULT_NETWORK.to_string(),
            os: OsFamily::Posix,
            ports: vec![],
            service_name: name.to_string(),
            volumes: vec![],
            address: String::new(),
        }
        .build("latest")
        .unwrap()
    }

    #[tokio::test]
    async fn create_emits_create_event() {
        let cluster = MockCluster::new();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut events, _) = cluster
            .events(EventFilter::new().with("type", "service"), shutdown)
            .await;

        let id = cluster.create_service(&spec("Foo-5000")).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.action, "create");
        assert_eq!(event.actor.id, id);
        assert_eq!(
            event.actor.attributes.get("name").map(String::as_str),
            Some("Foo-5000")
        );
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let cluster = MockCluster::new();
        cluster.create_service(&spec("Foo-5000")).await.unwrap();
        let err = cluster.create_service(&spec("Foo-5000")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_emits_updating_then_completed() {
        let cluster = MockCluster::new();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        cluster.create_service(&spec("Foo-5000")).await.unwrap();

        let (mut events, _) = cluster
            .events(EventFilter::new().with("event", "update"), shutdown)
            .await;
        cluster
            .update_service("Foo-5000", &spec("Foo-5000"), true)
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(
            first.actor.attributes.get("updatestate.new").map(String::as_str),
            Some("updating")
        );
        let second = events.recv().await.unwrap();
        assert_eq!(
            second.actor.attributes.get("updatestate.new").map(String::as_str),
            Some("completed")
        );
    }

    #[tokio::test]
    async fn remove_unknown_service_is_not_found() {
        let cluster = MockCluster::new();
        let err = cluster.remove_service("ghost").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn container_logs_replay_then_close() {
        let cluster = MockCluster::new();
        cluster.create_service(&spec("Foo-5000")).await.unwrap();
        let desc = cluster.service_named("Foo-5000").unwrap();
        cluster.set_container_logs(&desc.container_id, &["one", "two"]);

        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut logs, _) = cluster.container_logs(&desc.container_id, shutdown).await;
        assert_eq!(logs.recv().await.unwrap(), Bytes::from("one\n"));
        assert_eq!(logs.recv().await.unwrap(), Bytes::from("two\n"));
        assert!(logs.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_container_tail_fails() {
        let cluster = MockCluster::new();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut logs, mut errs) = cluster.container_logs("ghost", shutdown).await;
        assert!(logs.recv().await.is_none());
        assert!(matches!(
            errs.recv().await,
            Some(ClusterError::TailFailed(_))
        ));
    }
}
