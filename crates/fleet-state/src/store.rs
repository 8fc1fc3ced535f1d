//! StateStore: redb-backed state persistence for Fleetgate.
//!
//! Provides typed CRUD over the catalog tables, the instance registry, and
//! the activity log. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).
//!
//! redb admits one write transaction at a time, so every read-modify-write
//! done inside a single write transaction is serialised against all other
//! writers. The ledger and instance compare-and-swap rely on this.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Read and decode one row from a table opened in a write transaction.
pub(crate) fn read_row<T: DeserializeOwned>(
    table: &Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Encode and write one row into a table opened in a write transaction.
pub(crate) fn write_row<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Compare-and-swap an instance row inside an open write transaction.
///
/// `expected_revision` is the revision the caller read, or `None` if the
/// caller saw no row. On success the stored record (with its new revision)
/// is returned.
pub(crate) fn cas_instance(
    txn: &WriteTransaction,
    record: &InstanceRecord,
    expected_revision: Option<u64>,
) -> StateResult<InstanceRecord> {
    let key = record.table_key();
    let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
    let current: Option<InstanceRecord> = read_row(&table, &key)?;
    let current_revision = current.map(|r| r.revision);
    if current_revision != expected_revision {
        return Err(StateError::Conflict(format!(
            "instance {key}: expected revision {expected_revision:?}, found {current_revision:?}"
        )));
    }
    let mut stored = record.clone();
    stored.revision = expected_revision.map_or(1, |r| r + 1);
    write_row(&mut table, &key, &stored)?;
    Ok(stored)
}

/// Append an activity record inside an open write transaction.
pub(crate) fn append_activity_in(
    txn: &WriteTransaction,
    activity: &Activity,
) -> StateResult<Activity> {
    let mut table = txn.open_table(ACTIVITY).map_err(map_err!(Table))?;
    let last_seq = match table.last().map_err(map_err!(Read))? {
        Some((key, _)) => key.value().parse::<u64>().unwrap_or(0),
        None => 0,
    };
    let mut stored = activity.clone();
    stored.seq = last_seq + 1;
    write_row(&mut table, &activity_key(stored.seq), &stored)?;
    Ok(stored)
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            APPLICATIONS,
            PACKAGES,
            CHANNELS,
            GROUPS,
            INSTANCES,
            LEDGER_PERIODS,
            FAILURE_WINDOWS,
            ACTIVITY,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub(crate) fn begin_write(&self) -> StateResult<WriteTransaction> {
        self.db.begin_write().map_err(map_err!(Transaction))
    }

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let txn = self.begin_write()?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            write_row(&mut t, key, value)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub(crate) fn get<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All rows of a table whose key starts with `prefix`.
    fn scan<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Applications ───────────────────────────────────────────────

    pub fn put_application(&self, app: &Application) -> StateResult<()> {
        self.put(APPLICATIONS, &app.id, app)?;
        debug!(application = %app.id, "application stored");
        Ok(())
    }

    pub fn get_application(&self, id: &str) -> StateResult<Option<Application>> {
        self.get(APPLICATIONS, id)
    }

    pub fn list_applications(&self) -> StateResult<Vec<Application>> {
        self.scan(APPLICATIONS, "")
    }

    // ── Packages ───────────────────────────────────────────────────

    pub fn put_package(&self, pkg: &Package) -> StateResult<()> {
        self.put(PACKAGES, &pkg.id, pkg)?;
        debug!(package = %pkg.id, version = %pkg.version, "package stored");
        Ok(())
    }

    pub fn get_package(&self, id: &str) -> StateResult<Option<Package>> {
        self.get(PACKAGES, id)
    }

    // ── Channels ───────────────────────────────────────────────────

    pub fn put_channel(&self, channel: &Channel) -> StateResult<()> {
        self.put(CHANNELS, &channel.id, channel)?;
        debug!(channel = %channel.id, package = ?channel.package_id, "channel stored");
        Ok(())
    }

    pub fn get_channel(&self, id: &str) -> StateResult<Option<Channel>> {
        self.get(CHANNELS, id)
    }

    /// Channel plus the package it points at, from one read snapshot.
    pub fn get_channel_resolved(&self, id: &str) -> StateResult<Option<ResolvedChannel>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let channels = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
        let channel: Channel = match channels.get(id).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value())?,
            None => return Ok(None),
        };
        let package = match &channel.package_id {
            Some(package_id) => {
                let packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
                match packages.get(package_id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                }
            }
            None => None,
        };
        Ok(Some(ResolvedChannel { channel, package }))
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn put_group(&self, group: &Group) -> StateResult<()> {
        self.put(GROUPS, &group.id, group)?;
        debug!(group = %group.id, "group stored");
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> StateResult<Option<Group>> {
        self.get(GROUPS, id)
    }

    pub fn list_groups(&self) -> StateResult<Vec<Group>> {
        self.scan(GROUPS, "")
    }

    /// Group, channel and effective package from one read snapshot.
    pub fn get_group_context(&self, group_id: &str) -> StateResult<Option<GroupContext>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let group: Group = match groups.get(group_id).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value())?,
            None => return Ok(None),
        };
        let channels = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
        let channel: Channel = match channels.get(group.channel_id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value())?,
            None => {
                return Err(StateError::NotFound(format!(
                    "channel {} of group {group_id}",
                    group.channel_id
                )))
            }
        };
        let package = match &channel.package_id {
            Some(package_id) => {
                let packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
                match packages.get(package_id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                }
            }
            None => None,
        };
        Ok(Some(GroupContext {
            group,
            channel,
            package,
        }))
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn get_instance(
        &self,
        application_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, &instance_key(application_id, instance_id))
    }

    /// Write an instance row if nobody else wrote it since `expected_revision`.
    pub fn put_instance_checked(
        &self,
        record: &InstanceRecord,
        expected_revision: Option<u64>,
    ) -> StateResult<InstanceRecord> {
        let txn = self.begin_write()?;
        let stored = match cas_instance(&txn, record, expected_revision) {
            Ok(stored) => stored,
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    pub fn list_instances_for_application(
        &self,
        application_id: &str,
    ) -> StateResult<Vec<InstanceRecord>> {
        self.scan(INSTANCES, &instance_prefix(application_id))
    }

    // ── Activity ───────────────────────────────────────────────────

    pub fn append_activity(&self, activity: &Activity) -> StateResult<Activity> {
        let txn = self.begin_write()?;
        let stored = append_activity_in(&txn, activity)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq = stored.seq, kind = ?stored.kind, "activity appended");
        Ok(stored)
    }

    /// Most recent activity first.
    pub fn list_activity(&self, limit: usize) -> StateResult<Vec<Activity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIVITY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Ledger reads ───────────────────────────────────────────────

    pub fn list_ledger_entries(&self, group_id: &str) -> StateResult<Vec<LedgerEntry>> {
        self.scan(LEDGER_PERIODS, &ledger_prefix(group_id))
    }
}
