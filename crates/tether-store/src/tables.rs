//! redb table definitions for the Tether store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized rows).

use redb::TableDefinition;

/// Plugin rows keyed by `Name`.
pub const PLUGINS: TableDefinition<&str, &[u8]> = TableDefinition::new("plugins");

/// Port rows keyed by node `Address`.
pub const PORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("ports");

/// Log rows keyed by a zero-padded insertion sequence number.
pub const LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");
