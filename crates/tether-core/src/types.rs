//! Types shared between the store and the orchestrator adapter.

use serde::{Deserialize, Serialize};

/// OS family a plugin (or node) belongs to.
///
/// Plugin rows use `all` for images that run anywhere; nodes are always
/// `posix` or `nt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    #[default]
    Posix,
    Nt,
    All,
}

impl OsFamily {
    /// Map an orchestrator node OS string onto an OS family.
    pub fn from_node_os(os: &str) -> Self {
        match os.to_ascii_lowercase().as_str() {
            "windows" => OsFamily::Nt,
            _ => OsFamily::Posix,
        }
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Parse a `"<port>/<proto>"` string into its parts.
///
/// A bare `"<port>"` defaults to TCP. Returns `None` for anything that
/// is not a valid port spec.
pub fn parse_port_spec(spec: &str) -> Option<(u16, Protocol)> {
    let (port, proto) = match spec.split_once('/') {
        Some((port, proto)) => {
            let proto = match proto.to_ascii_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                _ => return None,
            };
            (port, proto)
        }
        None => (spec, Protocol::Tcp),
    };
    port.trim().parse::<u16>().ok().map(|p| (p, proto))
}

/// Format a port and protocol as the canonical `"<port>/<proto>"` string.
pub fn format_port_spec(port: u16, proto: Protocol) -> String {
    format!("{port}/{}", proto.as_str())
}
