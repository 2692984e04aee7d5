//! Event classification.
//!
//! Pure mapping from an orchestrator event to the plugin row patch it
//! implies. Events that carry no plugin-relevant transition map to
//! `None` and are acknowledged without a write.

use tether_cluster::EventRecord;
use tether_store::{DesiredState, PluginFilter, PluginPatch, PluginState};

/// The patch a classified event applies, with its row filter.
pub type Classified = (PluginFilter, PluginPatch);

/// Classify an event into a row filter and patch.
///
/// Every patch clears `DesiredState`: observing the orchestrator-side
/// transition is what latches the operator's request as done.
pub fn classify(event: &EventRecord) -> Option<Classified> {
    if event.typ != "service" {
        return None;
    }
    let name = event.actor.attributes.get("name")?;
    let filter = PluginFilter::by_service_name(name);

    // Update-state transitions arrive as `update` actions with the
    // rolling-update state in the actor attributes.
    if let Some(update_state) = event.actor.attributes.get("updatestate.new") {
        let state = match update_state.as_str() {
            "updating" => PluginState::Restarting,
            "completed" => PluginState::Active,
            _ => return None,
        };
        return Some((
            filter,
            PluginPatch {
                state: Some(state),
                desired_state: Some(DesiredState::None),
                ..PluginPatch::default()
            },
        ));
    }

    match event.action.as_str() {
        "create" => Some((
            filter,
            PluginPatch {
                state: Some(PluginState::Active),
                service_id: Some(event.actor.id.clone()),
                desired_state: Some(DesiredState::None),
                ..PluginPatch::default()
            },
        )),
        "remove" => Some((
            filter,
            PluginPatch {
                state: Some(PluginState::Stopped),
                desired_state: Some(DesiredState::None),
                ..PluginPatch::default()
            },
        )),
        _ => None,
    }
}

/// Derive the logical plugin name from a service name.
///
/// User plugin services are named `<Name>-<port>`; the reserved
/// `AuxiliaryServices` service maps to the `AuxServices` row. Used to
/// adopt services whose rows are not yet bound by `ServiceName`.
pub fn plugin_name_for_service(service_name: &str) -> String {
    if service_name == "AuxiliaryServices" {
        return "AuxServices".to_string();
    }
    match service_name.rsplit_once('-') {
        Some((name, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => {
            name.to_string()
        }
        _ => service_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tether_cluster::EventActor;

    fn event(typ: &str, action: &str, attributes: &[(&str, &str)]) -> EventRecord {
        EventRecord {
            typ: typ.to_string(),
            action: action.to_string(),
            actor: EventActor {
                id: "svc-1".to_string(),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    #[test]
    fn service_create_activates_and_binds() {
        let (filter, patch) =
            classify(&event("service", "create", &[("name", "Foo-5000")])).unwrap();
        assert_eq!(filter, PluginFilter::by_service_name("Foo-5000"));
        assert_eq!(patch.state, Some(PluginState::Active));
        assert_eq!(patch.service_id.as_deref(), Some("svc-1"));
        assert_eq!(patch.desired_state, Some(DesiredState::None));
    }

    #[test]
    fn service_remove_stops() {
        let (_, patch) =
            classify(&event("service", "remove", &[("name", "Foo-5000")])).unwrap();
        assert_eq!(patch.state, Some(PluginState::Stopped));
        assert_eq!(patch.desired_state, Some(DesiredState::None));
        assert!(patch.service_id.is_none());
    }

    #[test]
    fn update_state_transitions() {
        let (_, patch) = classify(&event(
            "service",
            "update",
            &[("name", "Foo-5000"), ("updatestate.new", "updating")],
        ))
        .unwrap();
        assert_eq!(patch.state, Some(PluginState::Restarting));

        let (_, patch) = classify(&event(
            "service",
            "update",
            &[("name", "Foo-5000"), ("updatestate.new", "completed")],
        ))
        .unwrap();
        assert_eq!(patch.state, Some(PluginState::Active));
    }

    #[test]
    fn irrelevant_events_are_noops() {
        assert!(classify(&event("container", "start", &[("name", "x")])).is_none());
        assert!(classify(&event("service", "create", &[])).is_none());
        assert!(classify(&event("service", "update", &[("name", "x")])).is_none());
        assert!(classify(&event(
            "service",
            "update",
            &[("name", "x"), ("updatestate.new", "paused")],
        ))
        .is_none());
    }

    #[test]
    fn plugin_name_derivation() {
        assert_eq!(plugin_name_for_service("Harness-5000"), "Harness");
        assert_eq!(plugin_name_for_service("AuxiliaryServices"), "AuxServices");
        assert_eq!(plugin_name_for_service("plain"), "plain");
        // A non-numeric suffix is part of the name.
        assert_eq!(plugin_name_for_service("multi-word"), "multi-word");
        assert_eq!(plugin_name_for_service("multi-word-8080"), "multi-word");
    }
}
