//! Event pipeline — applies classified events to the store.

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use tether_cluster::EventRecord;
use tether_store::{PluginFilter, PluginPatch, Store};

use crate::classify::{classify, plugin_name_for_service};
use crate::error::EventError;

/// Acknowledgement of one processed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Service the event concerned; empty for no-op events.
    pub service_name: String,
    /// Rows modified by the resulting patch.
    pub modified: usize,
}

/// Applies orchestrator events to the `plugins` table.
pub struct EventPipeline {
    store: Store,
}

impl EventPipeline {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Start the pipeline over an event stream.
    ///
    /// Returns one ack per inbound event and a stream of write errors.
    /// Processing is at-least-once: errors do not stop the loop.
    pub fn spawn(
        self,
        mut events: mpsc::Receiver<EventRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<WriteAck>, mpsc::Receiver<EventError>) {
        let (ack_tx, ack_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let ack = match self.apply(&event) {
                            Ok(ack) => ack,
                            Err(e) => {
                                warn!(error = %e, "event write failed, continuing");
                                let _ = err_tx.send(e).await;
                                continue;
                            }
                        };
                        if ack_tx.send(ack).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("event pipeline stopped");
        });

        (ack_rx, err_rx)
    }

    fn apply(&self, event: &EventRecord) -> Result<WriteAck, EventError> {
        let Some((filter, patch)) = classify(event) else {
            return Ok(WriteAck {
                service_name: String::new(),
                modified: 0,
            });
        };
        let service_name = filter
            .service_name
            .clone()
            .unwrap_or_default();

        let mut modified = self
            .store
            .update_plugins(&filter, &patch)
            .map_err(|source| EventError::Write {
                service: service_name.clone(),
                source,
            })?;

        // A create event can land before the reconciler has bound the
        // row's service name. Adopt the unbound row by its logical
        // plugin name, binding the name as part of the same patch.
        if modified == 0 && event.action == "create" {
            let adopt_filter = PluginFilter {
                name: Some(plugin_name_for_service(&service_name)),
                service_name: Some(String::new()),
                ..PluginFilter::default()
            };
            let adopt_patch = PluginPatch {
                service_name: Some(service_name.clone()),
                ..patch
            };
            modified = self
                .store
                .update_plugins(&adopt_filter, &adopt_patch)
                .map_err(|source| EventError::Write {
                    service: service_name.clone(),
                    source,
                })?;
        }

        debug!(service = %service_name, modified, action = %event.action, "event applied");
        Ok(WriteAck {
            service_name,
            modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tether_cluster::EventActor;
    use tether_core::OsFamily;
    use tether_store::{DesiredState, PluginRow, PluginState};

    fn create_event(service: &str, id: &str) -> EventRecord {
        EventRecord {
            typ: "service".to_string(),
            action: "create".to_string(),
            actor: EventActor {
                id: id.to_string(),
                attributes: HashMap::from([("name".to_string(), service.to_string())]),
            },
        }
    }

    fn bound_row(name: &str, service_name: &str) -> PluginRow {
        let mut row = PluginRow::available(name, OsFamily::Posix);
        row.service_name = service_name.to_string();
        row
    }

    async fn run_one(store: &Store, event: EventRecord) -> WriteAck {
        let (event_tx, event_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut acks, _) = EventPipeline::new(store.clone())
            .spawn(event_rx, shutdown);
        event_tx.send(event).await.unwrap();
        acks.recv().await.unwrap()
    }

    #[tokio::test]
    async fn create_event_activates_bound_row() {
        let store = Store::open_in_memory().unwrap();
        let mut row = bound_row("Foo", "Foo-5000");
        row.desired_state = DesiredState::Activate;
        store.insert_plugin(&row).unwrap();

        let ack = run_one(&store, create_event("Foo-5000", "svc-1")).await;
        assert_eq!(ack.modified, 1);

        let row = store.get_plugin("Foo").unwrap().unwrap();
        assert_eq!(row.state, PluginState::Active);
        assert_eq!(row.service_id, "svc-1");
        assert_eq!(row.desired_state, DesiredState::None);
    }

    #[tokio::test]
    async fn create_event_adopts_unbound_row() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_plugin(&PluginRow::available("Harness", OsFamily::All))
            .unwrap();

        let ack = run_one(&store, create_event("Harness-5000", "svc-9")).await;
        assert_eq!(ack.modified, 1);

        let row = store.get_plugin("Harness").unwrap().unwrap();
        assert_eq!(row.state, PluginState::Active);
        assert_eq!(row.service_name, "Harness-5000");
        assert_eq!(row.service_id, "svc-9");
    }

    #[tokio::test]
    async fn unmatched_event_acks_zero_modifications() {
        let store = Store::open_in_memory().unwrap();
        let ack = run_one(&store, create_event("Ghost-5000", "svc-1")).await;
        assert_eq!(ack.modified, 0);
        assert_eq!(ack.service_name, "Ghost-5000");
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.insert_plugin(&bound_row("Foo", "Foo-5000")).unwrap();

        let (event_tx, event_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut acks, _) = EventPipeline::new(store.clone())
            .spawn(event_rx, shutdown);

        event_tx.send(create_event("Foo-5000", "svc-1")).await.unwrap();
        assert_eq!(acks.recv().await.unwrap().modified, 1);
        let after_first = store.get_plugin("Foo").unwrap().unwrap();

        // Same event again: the patch matches the row's current state,
        // so nothing changes.
        event_tx.send(create_event("Foo-5000", "svc-1")).await.unwrap();
        assert_eq!(acks.recv().await.unwrap().modified, 0);
        assert_eq!(store.get_plugin("Foo").unwrap().unwrap(), after_first);
    }

    #[tokio::test]
    async fn restart_cycle_tracks_states() {
        let store = Store::open_in_memory().unwrap();
        let mut row = bound_row("Foo", "Foo-5000");
        row.state = PluginState::Active;
        row.desired_state = DesiredState::Restart;
        store.insert_plugin(&row).unwrap();

        let updating = EventRecord {
            typ: "service".to_string(),
            action: "update".to_string(),
            actor: EventActor {
                id: "svc-1".to_string(),
                attributes: HashMap::from([
                    ("name".to_string(), "Foo-5000".to_string()),
                    ("updatestate.new".to_string(), "updating".to_string()),
                ]),
            },
        };
        let mut completed = updating.clone();
        completed
            .actor
            .attributes
            .insert("updatestate.new".to_string(), "completed".to_string());

        let (event_tx, event_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut acks, _) = EventPipeline::new(store.clone())
            .spawn(event_rx, shutdown);

        event_tx.send(updating).await.unwrap();
        acks.recv().await.unwrap();
        assert_eq!(
            store.get_plugin("Foo").unwrap().unwrap().state,
            PluginState::Restarting
        );

        event_tx.send(completed).await.unwrap();
        acks.recv().await.unwrap();
        let row = store.get_plugin("Foo").unwrap().unwrap();
        assert_eq!(row.state, PluginState::Active);
        assert_eq!(row.desired_state, DesiredState::None);
    }

    #[tokio::test]
    async fn remove_event_stops_row() {
        let store = Store::open_in_memory().unwrap();
        let mut row = bound_row("Foo", "Foo-5000");
        row.state = PluginState::Active;
        store.insert_plugin(&row).unwrap();

        let remove = EventRecord {
            typ: "service".to_string(),
            action: "remove".to_string(),
            actor: EventActor {
                id: "svc-1".to_string(),
                attributes: HashMap::from([("name".to_string(), "Foo-5000".to_string())]),
            },
        };
        run_one(&store, remove).await;

        let row = store.get_plugin("Foo").unwrap().unwrap();
        assert_eq!(row.state, PluginState::Stopped);
    }
}
