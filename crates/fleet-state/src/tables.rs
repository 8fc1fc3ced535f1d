//! redb table definitions for the Fleetgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Applications keyed by `{application_id}`.
pub const APPLICATIONS: JsonTable = TableDefinition::new("applications");

/// Packages keyed by `{package_id}`.
pub const PACKAGES: JsonTable = TableDefinition::new("packages");

/// Channels keyed by `{channel_id}`.
pub const CHANNELS: JsonTable = TableDefinition::new("channels");

/// Groups keyed by `{group_id}`.
pub const GROUPS: JsonTable = TableDefinition::new("groups");

/// Instance registry keyed by `{application_id}:{instance_id}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Per-period grant counters keyed by `{group_id}:{period_start:020}`.
pub const LEDGER_PERIODS: JsonTable = TableDefinition::new("ledger_periods");

/// Trailing outcome windows keyed by `{group_id}`.
pub const FAILURE_WINDOWS: JsonTable = TableDefinition::new("failure_windows");

/// Activity records keyed by a zero-padded sequence number.
pub const ACTIVITY: JsonTable = TableDefinition::new("activity");
