//! Store — redb-backed document tables with change feeds.
//!
//! All writes serialize through a write gate; plugin changes are
//! published on a broadcast channel after commit, under the same gate,
//! so subscribers observe per-row changes in commit order.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Capacity of the plugin change feed.
///
/// Subscribers that fall further behind than this observe a lag error,
/// not silent loss.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// A single observed write to the `plugins` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginChange {
    pub old: Option<PluginRow>,
    pub new: Option<PluginRow>,
}

/// Thread-safe document store backed by redb.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    /// Serializes writers and the publish that follows each commit.
    write_gate: Arc<Mutex<()>>,
    plugin_feed: broadcast::Sender<PluginChange>,
    log_seq: Arc<AtomicU64>,
}

impl Store {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Unavailable))?;
        let store = Self::from_db(db)?;
        debug!(?path, "store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Unavailable))?;
        let store = Self::from_db(db)?;
        debug!("in-memory store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> StoreResult<Self> {
        let (plugin_feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            write_gate: Arc::new(Mutex::new(())),
            plugin_feed,
            log_seq: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        store
            .log_seq
            .store(store.last_log_seq()? + 1, Ordering::SeqCst);
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PLUGINS).map_err(map_err!(Table))?;
        txn.open_table(PORTS).map_err(map_err!(Table))?;
        txn.open_table(LOGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn last_log_seq(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOGS).map_err(map_err!(Table))?;
        match table.last().map_err(map_err!(Read))? {
            Some((key, _)) => Ok(key.value().parse::<u64>().unwrap_or(0)),
            None => Ok(0),
        }
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the plugin change feed.
    pub fn plugin_changes(&self) -> broadcast::Receiver<PluginChange> {
        self.plugin_feed.subscribe()
    }

    fn publish(&self, change: PluginChange) {
        // Nobody listening is fine; the feed is best-effort fan-out.
        let _ = self.plugin_feed.send(change);
    }

    // ── Plugins ────────────────────────────────────────────────────

    /// Get a plugin row by its logical name.
    pub fn get_plugin(&self, name: &str) -> StoreResult<Option<PluginRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLUGINS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let row: PluginRow =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// List all plugin rows.
    pub fn list_plugins(&self) -> StoreResult<Vec<PluginRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLUGINS).map_err(map_err!(Table))?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: PluginRow =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Insert a new plugin row. Fails if a row with the same `Name`
    /// already exists.
    pub fn insert_plugin(&self, row: &PluginRow) -> StoreResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let _gate = self.gate();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PLUGINS).map_err(map_err!(Table))?;
            if table.get(row.name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StoreError::Duplicate(row.name.clone()));
            }
            table
                .insert(row.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %row.name, "plugin row inserted");
        self.publish(PluginChange {
            old: None,
            new: Some(row.clone()),
        });
        Ok(())
    }

    /// Filter-and-patch over plugin rows.
    ///
    /// Applies `patch` to every row `filter` matches and returns how
    /// many rows were modified. Matching zero rows is success with
    /// count 0 — this is what makes re-delivered events idempotent.
    pub fn update_plugins(
        &self,
        filter: &PluginFilter,
        patch: &PluginPatch,
    ) -> StoreResult<usize> {
        if patch.is_empty() {
            return Ok(0);
        }

        let _gate = self.gate();
        let mut changes = Vec::new();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PLUGINS).map_err(map_err!(Table))?;

            let mut matched = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let row: PluginRow =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if filter.matches(&row) {
                    matched.push((key.value().to_string(), row));
                }
            }

            for (key, old) in matched {
                let mut new = old.clone();
                patch.apply(&mut new);
                if new == old {
                    continue;
                }
                let value = serde_json::to_vec(&new).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                changes.push(PluginChange {
                    old: Some(old),
                    new: Some(new),
                });
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        let modified = changes.len();
        for change in changes {
            self.publish(change);
        }
        Ok(modified)
    }

    // ── Ports ──────────────────────────────────────────────────────

    /// Get a port row by node address.
    pub fn get_port_row(&self, address: &str) -> StoreResult<Option<PortRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORTS).map_err(map_err!(Table))?;
        match table.get(address).map_err(map_err!(Read))? {
            Some(guard) => {
                let row: PortRow =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// List all port rows.
    pub fn list_port_rows(&self) -> StoreResult<Vec<PortRow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORTS).map_err(map_err!(Table))?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: PortRow =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Insert or replace a port row, keyed by `Address`.
    pub fn upsert_port_row(&self, row: &PortRow) -> StoreResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let _gate = self.gate();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PORTS).map_err(map_err!(Table))?;
            table
                .insert(row.address.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(address = %row.address, "port row stored");
        Ok(())
    }

    // ── Logs ───────────────────────────────────────────────────────

    /// Append a log entry, stamping `rt` with the current epoch
    /// milliseconds. Returns the assigned sequence number.
    pub fn insert_log(&self, mut entry: LogEntry) -> StoreResult<u64> {
        entry.rt = epoch_millis();
        let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
        let seq = self.log_seq.fetch_add(1, Ordering::SeqCst);
        let key = format!("{seq:020}");

        let _gate = self.gate();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOGS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// List all log entries in insertion order.
    pub fn list_logs(&self) -> StoreResult<Vec<LogEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOGS).map_err(map_err!(Table))?;
        let mut entries = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: LogEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            entries.push(row);
        }
        Ok(entries)
    }
}

/// Current Unix epoch in milliseconds.
fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::OsFamily;

    fn test_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn insert_and_get_plugin() {
        let store = test_store();
        let row = PluginRow::available("Harness", OsFamily::All);
        store.insert_plugin(&row).unwrap();

        let got = store.get_plugin("Harness").unwrap().unwrap();
        assert_eq!(got, row);
        assert!(store.get_plugin("Other").unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = test_store();
        let row = PluginRow::available("Harness", OsFamily::All);
        store.insert_plugin(&row).unwrap();

        let err = store.insert_plugin(&row).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[test]
    fn update_plugins_patches_matching_rows() {
        let store = test_store();
        store
            .insert_plugin(&PluginRow::available("Foo", OsFamily::Posix))
            .unwrap();
        store
            .insert_plugin(&PluginRow::available("Bar", OsFamily::Posix))
            .unwrap();

        let modified = store
            .update_plugins(
                &PluginFilter::by_name("Foo"),
                &PluginPatch {
                    state: Some(PluginState::Active),
                    service_id: Some("svc-1".to_string()),
                    ..PluginPatch::default()
                },
            )
            .unwrap();
        assert_eq!(modified, 1);

        let foo = store.get_plugin("Foo").unwrap().unwrap();
        assert_eq!(foo.state, PluginState::Active);
        assert_eq!(foo.service_id, "svc-1");

        let bar = store.get_plugin("Bar").unwrap().unwrap();
        assert_eq!(bar.state, PluginState::Available);
    }

    #[test]
    fn update_with_no_match_is_zero_not_error() {
        let store = test_store();
        let modified = store
            .update_plugins(
                &PluginFilter::by_service_name("Ghost-5000"),
                &PluginPatch {
                    state: Some(PluginState::Active),
                    ..PluginPatch::default()
                },
            )
            .unwrap();
        assert_eq!(modified, 0);
    }

    #[test]
    fn no_op_patch_modifies_nothing() {
        let store = test_store();
        store
            .insert_plugin(&PluginRow::available("Foo", OsFamily::Posix))
            .unwrap();

        // Patching a field to the value it already has counts as no
        // modification, so re-applying a patch is idempotent.
        let patch = PluginPatch {
            state: Some(PluginState::Active),
            ..PluginPatch::default()
        };
        assert_eq!(
            store
                .update_plugins(&PluginFilter::by_name("Foo"), &patch)
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .update_plugins(&PluginFilter::by_name("Foo"), &patch)
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn change_feed_sees_inserts_and_updates_in_order() {
        let store = test_store();
        let mut feed = store.plugin_changes();

        store
            .insert_plugin(&PluginRow::available("Foo", OsFamily::Posix))
            .unwrap();
        store
            .update_plugins(
                &PluginFilter::by_name("Foo"),
                &PluginPatch {
                    desired_state: Some(DesiredState::Activate),
                    ..PluginPatch::default()
                },
            )
            .unwrap();

        let first = feed.recv().await.unwrap();
        assert!(first.old.is_none());
        assert_eq!(first.new.as_ref().unwrap().name, "Foo");

        let second = feed.recv().await.unwrap();
        assert_eq!(
            second.old.as_ref().unwrap().desired_state,
            DesiredState::None
        );
        assert_eq!(
            second.new.as_ref().unwrap().desired_state,
            DesiredState::Activate
        );
    }

    #[test]
    fn port_row_round_trip() {
        let store = test_store();
        let row = PortRow {
            address: "10.0.0.5".to_string(),
            node_host_name: "n1".to_string(),
            os: OsFamily::Posix,
            tcp_ports: vec![],
            udp_ports: vec![],
        };
        store.upsert_port_row(&row).unwrap();
        assert_eq!(store.get_port_row("10.0.0.5").unwrap().unwrap(), row);
        assert_eq!(store.list_port_rows().unwrap().len(), 1);
    }

    #[test]
    fn logs_are_appended_in_order_with_rt_stamped() {
        let store = test_store();
        for i in 0..5 {
            let seq = store
                .insert_log(LogEntry {
                    container_id: "ctr-1".to_string(),
                    msg: format!("line {i}"),
                    ..LogEntry::default()
                })
                .unwrap();
            assert_eq!(seq, i + 1);
        }

        let logs = store.list_logs().unwrap();
        assert_eq!(logs.len(), 5);
        for window in logs.windows(2) {
            assert!(window[1].rt >= window[0].rt);
        }
        assert_eq!(logs[0].msg, "line 0");
        assert_eq!(logs[4].msg, "line 4");
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.redb");

        {
            let store = Store::open(&path).unwrap();
            store
                .insert_plugin(&PluginRow::available("Foo", OsFamily::Posix))
                .unwrap();
            store
                .insert_log(LogEntry {
                    msg: "persisted".to_string(),
                    ..LogEntry::default()
                })
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(store.get_plugin("Foo").unwrap().is_some());
        assert_eq!(store.list_logs().unwrap().len(), 1);
        // Sequence continues after the persisted tail.
        let seq = store.insert_log(LogEntry::default()).unwrap();
        assert_eq!(seq, 2);
    }
}
