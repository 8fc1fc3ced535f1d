//! Domain types for the Fleetgate state store.
//!
//! These types represent the catalog (applications, packages, channels,
//! groups), the instance registry, the statistics ledger, and activity
//! records. All types are serializable to/from JSON for storage in redb
//! tables.

use std::collections::BTreeSet;

use fleet_core::Arch;
use serde::{Deserialize, Serialize};

use crate::window::FailureWindow;

pub type ApplicationId = String;
pub type PackageId = String;
pub type ChannelId = String;
pub type GroupId = String;
pub type InstanceId = String;

// ── Catalog ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: ApplicationId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: u64,
}

/// Where devices fetch a package's payload from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub url: String,
    pub filename: String,
    /// Hex-encoded SHA-256 of the payload.
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub id: PackageId,
    pub application_id: ApplicationId,
    pub arch: Arch,
    pub version: String,
    pub artifact: ArtifactRef,
    /// Channels that must never point at this package.
    #[serde(default)]
    pub channels_blacklist: BTreeSet<ChannelId>,
    pub created_at: u64,
}

impl Package {
    pub fn blacklists(&self, channel_id: &str) -> bool {
        self.channels_blacklist.contains(channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub application_id: ApplicationId,
    pub arch: Arch,
    pub package_id: Option<PackageId>,
    pub created_at: u64,
}

/// A channel together with the package row it pointed at when read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedChannel {
    pub channel: Channel,
    pub package: Option<Package>,
}

/// Trip condition for the safe-mode circuit breaker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FailureThreshold {
    /// Trips when failures / outcomes in the window exceeds this fraction.
    Ratio(f64),
    /// Trips when failures in the window exceed this count.
    Count(u32),
}

impl FailureThreshold {
    pub fn exceeded_by(&self, failures: u64, total: u64) -> bool {
        match *self {
            FailureThreshold::Ratio(limit) => {
                total > 0 && (failures as f64 / total as f64) > limit
            }
            FailureThreshold::Count(limit) => failures > u64::from(limit),
        }
    }
}

/// Knobs governing throttle rate, timeout, and failure-halt behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RolloutPolicy {
    pub updates_enabled: bool,
    pub max_updates_per_period: u32,
    pub period_interval_secs: u64,
    /// A grant with no event report for this long is treated as abandoned.
    pub update_timeout_secs: u64,
    pub safe_mode: bool,
    pub failure_threshold: FailureThreshold,
    /// Length of the trailing outcome window the breaker looks at.
    pub failure_window_secs: u64,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            updates_enabled: true,
            max_updates_per_period: 100,
            period_interval_secs: 3600,
            update_timeout_secs: 3600,
            safe_mode: false,
            failure_threshold: FailureThreshold::Ratio(0.5),
            failure_window_secs: 3600,
        }
    }
}

impl RolloutPolicy {
    /// Start of the period containing `now`, aligned to the Unix epoch.
    pub fn period_start(&self, now: u64) -> u64 {
        let interval = self.period_interval_secs.max(1);
        now - now % interval
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub application_id: ApplicationId,
    pub channel_id: ChannelId,
    pub policy: RolloutPolicy,
    pub created_at: u64,
}

/// Group, its channel, and the channel's package, read in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupContext {
    pub group: Group,
    pub channel: Channel,
    pub package: Option<Package>,
}

// ── Instance registry ─────────────────────────────────────────────

/// Lifecycle status of an instance with respect to its latest grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Unknown,
    UpToDate,
    UpdateGranted,
    Downloading,
    Installing,
    Complete,
    Errored,
}

impl InstanceStatus {
    /// An update was handed out and no terminal event has arrived yet.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            InstanceStatus::UpdateGranted | InstanceStatus::Downloading | InstanceStatus::Installing
        )
    }
}

/// One row per (application, instance) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub application_id: ApplicationId,
    pub group_id: GroupId,
    /// Last version the instance reported running.
    pub version: String,
    pub status: InstanceStatus,
    /// Version of the package most recently granted, if any.
    pub granted_version: Option<String>,
    pub granted_at: Option<u64>,
    pub last_seen: u64,
    pub last_ip: Option<String>,
    /// Bumped on every write; used for compare-and-swap.
    #[serde(default)]
    pub revision: u64,
}

impl InstanceRecord {
    /// Fresh row for an instance seen for the first time.
    pub fn first_seen(
        application_id: &str,
        instance_id: &str,
        group_id: &str,
        version: &str,
        now: u64,
    ) -> Self {
        Self {
            id: instance_id.to_string(),
            application_id: application_id.to_string(),
            group_id: group_id.to_string(),
            version: version.to_string(),
            status: InstanceStatus::Unknown,
            granted_version: None,
            granted_at: None,
            last_seen: now,
            last_ip: None,
            revision: 0,
        }
    }

    pub fn table_key(&self) -> String {
        instance_key(&self.application_id, &self.id)
    }
}

/// Build the composite key for the instances table.
///
/// The application id is length-prefixed, so ids containing `:` cannot
/// collide and a prefix scan never crosses into another application.
pub fn instance_key(application_id: &str, instance_id: &str) -> String {
    format!("{}{instance_id}", instance_prefix(application_id))
}

/// Key prefix shared by all instances of one application.
pub fn instance_prefix(application_id: &str) -> String {
    format!("{}:{application_id}:", application_id.len())
}

// ── Statistics ledger ─────────────────────────────────────────────

/// Grant counter for one group and one period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub group_id: GroupId,
    pub period_start: u64,
    pub period_secs: u64,
    pub granted: u32,
}

impl LedgerEntry {
    pub fn table_key(&self) -> String {
        ledger_key(&self.group_id, self.period_start)
    }
}

/// Build the composite key for the ledger periods table.
pub fn ledger_key(group_id: &str, period_start: u64) -> String {
    format!("{}{period_start:020}", ledger_prefix(group_id))
}

/// Key prefix shared by all periods of one group.
pub fn ledger_prefix(group_id: &str) -> String {
    format!("{}:{group_id}:", group_id.len())
}

/// Read-only view of a group's statistics, as consumed by the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub group_id: GroupId,
    pub period_start: u64,
    pub granted: u32,
    pub successes: u64,
    pub failures: u64,
    /// Breaker state as of the last recorded transition.
    pub halted: bool,
}

impl LedgerSnapshot {
    pub fn empty(group_id: &str, period_start: u64) -> Self {
        Self {
            group_id: group_id.to_string(),
            period_start,
            granted: 0,
            successes: 0,
            failures: 0,
            halted: false,
        }
    }

    pub fn from_parts(
        group_id: &str,
        period_start: u64,
        granted: u32,
        window: &FailureWindow,
        now: u64,
    ) -> Self {
        let (successes, failures) = window.totals(now);
        Self {
            group_id: group_id.to_string(),
            period_start,
            granted,
            successes,
            failures,
            halted: window.halted,
        }
    }

    pub fn outcomes(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn failure_ratio(&self) -> f64 {
        match self.outcomes() {
            0 => 0.0,
            total => self.failures as f64 / total as f64,
        }
    }
}

// ── Activity ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ChannelPackageUpdated,
    RolloutHalted,
    RolloutResumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Audit record consumed by the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    /// Assigned by the store on append.
    #[serde(default)]
    pub seq: u64,
    pub kind: ActivityKind,
    pub severity: Severity,
    pub application_id: ApplicationId,
    pub group_id: Option<GroupId>,
    pub channel_id: Option<ChannelId>,
    pub version: Option<String>,
    pub created_at: u64,
}

impl Activity {
    pub fn channel_package_updated(channel: &Channel, package: &Package, now: u64) -> Self {
        Self {
            seq: 0,
            kind: ActivityKind::ChannelPackageUpdated,
            severity: Severity::Info,
            application_id: channel.application_id.clone(),
            group_id: None,
            channel_id: Some(channel.id.clone()),
            version: Some(package.version.clone()),
            created_at: now,
        }
    }

    /// Breaker transition for a group; `halted` picks the direction.
    pub fn rollout_transition(
        group: &Group,
        version: Option<&str>,
        halted: bool,
        now: u64,
    ) -> Self {
        let (kind, severity) = if halted {
            (ActivityKind::RolloutHalted, Severity::Error)
        } else {
            (ActivityKind::RolloutResumed, Severity::Info)
        };
        Self {
            seq: 0,
            kind,
            severity,
            application_id: group.application_id.clone(),
            group_id: Some(group.id.clone()),
            channel_id: Some(group.channel_id.clone()),
            version: version.map(str::to_string),
            created_at: now,
        }
    }
}

/// Build the key for the activity table.
pub fn activity_key(seq: u64) -> String {
    format!("{seq:020}")
}
