//! Port bookkeeping over the `ports` table.
//!
//! Each node row carries the TCP and UDP ports already handed out on
//! that node. The lists are sets: allocating a present port fails with
//! `PortInUse`, releasing an absent one with `PortNotFound`.

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use tether_core::Protocol;

impl Store {
    /// Allocate a port on a node.
    pub fn add_port(&self, address: &str, port: u16, proto: Protocol) -> StoreResult<()> {
        let mut row = self
            .get_port_row(address)?
            .ok_or_else(|| StoreError::NotFound(address.to_string()))?;

        let list = match proto {
            Protocol::Tcp => &mut row.tcp_ports,
            Protocol::Udp => &mut row.udp_ports,
        };
        let port = port.to_string();
        if list.contains(&port) {
            return Err(StoreError::PortInUse(format!(
                "{port}/{} on {address}",
                proto.as_str()
            )));
        }
        list.push(port.clone());

        self.upsert_port_row(&row)?;
        debug!(%address, %port, proto = proto.as_str(), "port allocated");
        Ok(())
    }

    /// Release a previously allocated port on a node.
    pub fn remove_port(&self, address: &str, port: u16, proto: Protocol) -> StoreResult<()> {
        let mut row = self
            .get_port_row(address)?
            .ok_or_else(|| StoreError::NotFound(address.to_string()))?;

        let list = match proto {
            Protocol::Tcp => &mut row.tcp_ports,
            Protocol::Udp => &mut row.udp_ports,
        };
        let port = port.to_string();
        let Some(index) = list.iter().position(|p| p == &port) else {
            return Err(StoreError::PortNotFound(format!(
                "{port}/{} on {address}",
                proto.as_str()
            )));
        };
        list.remove(index);

        self.upsert_port_row(&row)?;
        debug!(%address, %port, proto = proto.as_str(), "port released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortRow;
    use tether_core::OsFamily;

    fn store_with_node(address: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_port_row(&PortRow {
                address: address.to_string(),
                node_host_name: "n1".to_string(),
                os: OsFamily::Posix,
                tcp_ports: vec![],
                udp_ports: vec![],
            })
            .unwrap();
        store
    }

    #[test]
    fn add_then_remove_restores_the_row() {
        let store = store_with_node("10.0.0.5");
        let before = store.get_port_row("10.0.0.5").unwrap().unwrap();

        store.add_port("10.0.0.5", 5000, Protocol::Tcp).unwrap();
        let row = store.get_port_row("10.0.0.5").unwrap().unwrap();
        assert_eq!(row.tcp_ports, vec!["5000".to_string()]);
        assert!(row.udp_ports.is_empty());

        store.remove_port("10.0.0.5", 5000, Protocol::Tcp).unwrap();
        assert_eq!(store.get_port_row("10.0.0.5").unwrap().unwrap(), before);
    }

    #[test]
    fn double_allocation_fails_port_in_use() {
        let store = store_with_node("10.0.0.5");
        store.add_port("10.0.0.5", 5000, Protocol::Tcp).unwrap();

        let err = store.add_port("10.0.0.5", 5000, Protocol::Tcp).unwrap_err();
        assert!(matches!(err, StoreError::PortInUse(_)));
    }

    #[test]
    fn tcp_and_udp_lists_are_independent() {
        let store = store_with_node("10.0.0.5");
        store.add_port("10.0.0.5", 53, Protocol::Tcp).unwrap();
        // Same number, different protocol: allowed.
        store.add_port("10.0.0.5", 53, Protocol::Udp).unwrap();

        let row = store.get_port_row("10.0.0.5").unwrap().unwrap();
        assert_eq!(row.tcp_ports, vec!["53".to_string()]);
        assert_eq!(row.udp_ports, vec!["53".to_string()]);
    }

    #[test]
    fn removing_an_absent_port_fails_port_not_found() {
        let store = store_with_node("10.0.0.5");
        let err = store
            .remove_port("10.0.0.5", 5000, Protocol::Tcp)
            .unwrap_err();
        assert!(matches!(err, StoreError::PortNotFound(_)));
    }

    #[test]
    fn unknown_node_fails_not_found() {
        let store = store_with_node("10.0.0.5");
        let err = store.add_port("10.9.9.9", 5000, Protocol::Tcp).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
