//! Row types for the Tether store.
//!
//! Serialized field names match what the external UIs read from the
//! database, so the serde renames are part of the wire contract.

use serde::{Deserialize, Serialize};

use tether_core::OsFamily;

// ── Plugins ────────────────────────────────────────────────────────

/// Operator-requested next transition for a plugin.
///
/// Cleared (set back to `None`, serialized as `""`) by the event
/// pipeline once the orchestrator-side transition is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DesiredState {
    #[default]
    #[serde(rename = "")]
    None,
    Activate,
    Restart,
    Stop,
}

/// Observed lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PluginState {
    #[default]
    Available,
    Active,
    Restarting,
    Stopped,
}

/// One row of the `plugins` table: a logical plugin instance and its
/// binding to an orchestrator service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PluginRow {
    pub name: String,
    /// Orchestrator service name; empty until bound.
    pub service_name: String,
    /// Opaque orchestrator handle; empty until bound.
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub desired_state: DesiredState,
    pub state: PluginState,
    #[serde(rename = "OS")]
    pub os: OsFamily,
    /// Node-facing IP; empty until bound.
    pub address: String,
    /// Published ports as `"<port>/<proto>"` strings.
    pub external_ports: Vec<String>,
    /// Container-side ports as `"<port>/<proto>"` strings.
    pub internal_ports: Vec<String>,
    /// `KEY=VALUE` pairs injected into the service.
    pub environment: Vec<String>,
}

impl PluginRow {
    /// A fresh, unbound row in state `Available`, as seeded from the
    /// manifest.
    pub fn available(name: &str, os: OsFamily) -> Self {
        Self {
            name: name.to_string(),
            os,
            state: PluginState::Available,
            ..Self::default()
        }
    }
}

/// Predicate for `update_plugins`: every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginFilter {
    pub name: Option<String>,
    pub service_name: Option<String>,
    pub service_id: Option<String>,
}

impl PluginFilter {
    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn by_service_name(service_name: &str) -> Self {
        Self {
            service_name: Some(service_name.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &PluginRow) -> bool {
        if let Some(name) = &self.name {
            if &row.name != name {
                return false;
            }
        }
        if let Some(service_name) = &self.service_name {
            if &row.service_name != service_name {
                return false;
            }
        }
        if let Some(service_id) = &self.service_id {
            if &row.service_id != service_id {
                return false;
            }
        }
        true
    }
}

/// Field-level patch for `update_plugins`; `None` fields are untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginPatch {
    pub state: Option<PluginState>,
    pub desired_state: Option<DesiredState>,
    pub service_name: Option<String>,
    pub service_id: Option<String>,
    pub address: Option<String>,
    pub external_ports: Option<Vec<String>>,
    pub internal_ports: Option<Vec<String>>,
    pub os: Option<OsFamily>,
}

impl PluginPatch {
    pub fn apply(&self, row: &mut PluginRow) {
        if let Some(state) = self.state {
            row.state = state;
        }
        if let Some(desired_state) = self.desired_state {
            row.desired_state = desired_state;
        }
        if let Some(service_name) = &self.service_name {
            row.service_name = service_name.clone();
        }
        if let Some(service_id) = &self.service_id {
            row.service_id = service_id.clone();
        }
        if let Some(address) = &self.address {
            row.address = address.clone();
        }
        if let Some(external_ports) = &self.external_ports {
            row.external_ports = external_ports.clone();
        }
        if let Some(internal_ports) = &self.internal_ports {
            row.internal_ports = internal_ports.clone();
        }
        if let Some(os) = self.os {
            row.os = os;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ── Ports ──────────────────────────────────────────────────────────

/// One row of the `ports` table: a cluster node and its allocated
/// host ports. `TCPPorts`/`UDPPorts` are sets of bare port strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PortRow {
    pub address: String,
    pub node_host_name: String,
    #[serde(rename = "OS")]
    pub os: OsFamily,
    #[serde(rename = "TCPPorts")]
    pub tcp_ports: Vec<String>,
    #[serde(rename = "UDPPorts")]
    pub udp_ports: Vec<String>,
}

// ── Logs ───────────────────────────────────────────────────────────

/// One row of the `logs` table. Append-only; `rt` is stamped at insert
/// time in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogEntry {
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    #[serde(rename = "ContainerName")]
    pub container_name: String,
    pub msg: String,
    #[serde(rename = "sourceServiceName")]
    pub source_service_name: String,
    pub rt: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_state_serializes_with_empty_none() {
        assert_eq!(serde_json::to_string(&DesiredState::None).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&DesiredState::Activate).unwrap(),
            "\"Activate\""
        );
        let parsed: DesiredState = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, DesiredState::None);
    }

    #[test]
    fn plugin_row_wire_field_names() {
        let row = PluginRow::available("Harness", OsFamily::All);
        let value = serde_json::to_value(&row).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "Name",
            "ServiceName",
            "ServiceID",
            "DesiredState",
            "State",
            "OS",
            "Address",
            "ExternalPorts",
            "InternalPorts",
            "Environment",
        ] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
        assert_eq!(obj["State"], "Available");
        assert_eq!(obj["OS"], "all");
        assert_eq!(obj["DesiredState"], "");
    }

    #[test]
    fn port_row_wire_field_names() {
        let row = PortRow {
            address: "10.0.0.5".to_string(),
            node_host_name: "n1".to_string(),
            os: OsFamily::Posix,
            tcp_ports: vec!["5000".to_string()],
            udp_ports: vec![],
        };
        let value = serde_json::to_value(&row).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("TCPPorts"));
        assert!(obj.contains_key("UDPPorts"));
        assert!(obj.contains_key("NodeHostName"));
        assert_eq!(obj["OS"], "posix");
    }

    #[test]
    fn log_entry_wire_field_names() {
        let entry = LogEntry {
            container_id: "ctr-1".to_string(),
            container_name: "harness.1".to_string(),
            msg: "hello".to_string(),
            source_service_name: "Harness-5000".to_string(),
            rt: 42,
        };
        let value = serde_json::to_value(&entry).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("ContainerID"));
        assert!(obj.contains_key("sourceServiceName"));
        assert!(obj.contains_key("msg"));
        assert!(obj.contains_key("rt"));
    }

    #[test]
    fn filter_fields_are_anded() {
        let mut row = PluginRow::available("Foo", OsFamily::Posix);
        row.service_name = "Foo-5000".to_string();

        assert!(PluginFilter::by_name("Foo").matches(&row));
        assert!(PluginFilter::by_service_name("Foo-5000").matches(&row));
        assert!(!PluginFilter::by_service_name("Bar-5000").matches(&row));

        let both = PluginFilter {
            name: Some("Foo".to_string()),
            service_name: Some("Bar-5000".to_string()),
            ..PluginFilter::default()
        };
        assert!(!both.matches(&row));

        // An empty filter matches everything.
        assert!(PluginFilter::default().matches(&row));
    }

    #[test]
    fn patch_only_touches_populated_fields() {
        let mut row = PluginRow::available("Foo", OsFamily::Posix);
        row.desired_state = DesiredState::Activate;

        let patch = PluginPatch {
            state: Some(PluginState::Active),
            service_id: Some("svc-1".to_string()),
            ..PluginPatch::default()
        };
        patch.apply(&mut row);

        assert_eq!(row.state, PluginState::Active);
        assert_eq!(row.service_id, "svc-1");
        // Untouched by the patch.
        assert_eq!(row.desired_state, DesiredState::Activate);
        assert_eq!(row.name, "Foo");
    }
}
