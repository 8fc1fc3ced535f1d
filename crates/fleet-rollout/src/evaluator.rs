//! Rollout policy evaluator: decides what a single check-in gets.
//!
//! `evaluate` never touches the store. The caller reads a ledger snapshot
//! and the instance row, asks for a decision, and then commits it through
//! the ledger. Calling it again with the same inputs gives the same answer,
//! which is what the dry-run endpoint relies on.

use fleet_core::versions_match;
use fleet_state::{InstanceRecord, InstanceStatus, LedgerSnapshot, Package, RolloutPolicy};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Why a check-in was not granted an update it would otherwise get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The group has updates switched off.
    RolloutDisabled,
    /// Safe mode tripped on the trailing failure window.
    RolloutHalted,
    /// The current period's grant cap is used up.
    Throttled,
}

impl DenyReason {
    /// Reason code as sent to devices.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RolloutDisabled => "disabled",
            DenyReason::RolloutHalted => "halted",
            DenyReason::Throttled => "throttled",
        }
    }
}

/// Outcome of evaluating one check-in.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoUpdate,
    Denied(DenyReason),
    Granted {
        package: Package,
        /// `false` when this re-offers a grant the instance already holds.
        consumes_slot: bool,
    },
}

impl Decision {
    /// Wire status string for this decision.
    pub fn status(&self) -> &'static str {
        match self {
            Decision::NoUpdate => "no-update",
            Decision::Denied(reason) => reason.as_str(),
            Decision::Granted { .. } => "update",
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted { .. })
    }
}

/// The parts of an instance's state the evaluator looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceView<'a> {
    /// Version reported in the current check-in.
    pub version: &'a str,
    pub status: InstanceStatus,
    pub granted_version: Option<&'a str>,
    pub granted_at: Option<u64>,
}

impl<'a> InstanceView<'a> {
    /// An instance with no history.
    pub fn fresh(version: &'a str) -> Self {
        Self {
            version,
            status: InstanceStatus::Unknown,
            granted_version: None,
            granted_at: None,
        }
    }

    pub fn from_record(record: &'a InstanceRecord) -> Self {
        Self {
            version: &record.version,
            status: record.status,
            granted_version: record.granted_version.as_deref(),
            granted_at: record.granted_at,
        }
    }

    /// Whether the instance still holds a usable grant for `version`.
    ///
    /// An errored attempt keeps its grant so the device can retry. An
    /// in-flight grant lapses once `update_timeout_secs` pass without a
    /// terminal event.
    pub fn holds_grant_for(&self, version: &str, policy: &RolloutPolicy, now: u64) -> bool {
        let Some(granted) = self.granted_version else {
            return false;
        };
        if !versions_match(granted, version) {
            return false;
        }
        match self.status {
            InstanceStatus::Errored => true,
            s if s.is_in_flight() => self
                .granted_at
                .is_some_and(|at| now < at.saturating_add(policy.update_timeout_secs)),
            _ => false,
        }
    }
}

/// Whether safe mode should currently hold the group's rollout.
pub fn breaker_tripped(policy: &RolloutPolicy, snapshot: &LedgerSnapshot) -> bool {
    policy.safe_mode
        && policy
            .failure_threshold
            .exceeded_by(snapshot.failures, snapshot.outcomes())
}

/// Decide what one check-in receives.
///
/// Checks run in a fixed order: disabled, halted, nothing to offer, an
/// existing grant to re-offer, throttled, and finally a fresh grant.
pub fn evaluate(
    policy: &RolloutPolicy,
    snapshot: &LedgerSnapshot,
    instance: &InstanceView<'_>,
    target: Option<&Package>,
    now: u64,
) -> Decision {
    if !policy.updates_enabled {
        return Decision::Denied(DenyReason::RolloutDisabled);
    }

    if breaker_tripped(policy, snapshot) {
        return Decision::Denied(DenyReason::RolloutHalted);
    }

    let Some(package) = target else {
        return Decision::NoUpdate;
    };

    if versions_match(&package.version, instance.version)
        && instance.status != InstanceStatus::Errored
    {
        return Decision::NoUpdate;
    }

    if instance.holds_grant_for(&package.version, policy, now) {
        trace!(group = %snapshot.group_id, version = %package.version, "re-offering held grant");
        return Decision::Granted {
            package: package.clone(),
            consumes_slot: false,
        };
    }

    if snapshot.granted >= policy.max_updates_per_period {
        return Decision::Denied(DenyReason::Throttled);
    }

    Decision::Granted {
        package: package.clone(),
        consumes_slot: true,
    }
}
