//! Wire types for the check-in and event-report endpoints.

use std::fmt;

use fleet_rollout::{Decision, DenyReason};
use fleet_state::Package;
use serde::{Deserialize, Serialize};

/// A device asking whether it should update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInRequest {
    pub instance_id: String,
    pub app_id: String,
    pub group_id: String,
    /// Version currently installed on the device.
    pub version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckInStatus {
    Update,
    NoUpdate,
    Throttled,
    Halted,
    Disabled,
}

impl CheckInStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInStatus::Update => "update",
            CheckInStatus::NoUpdate => "no-update",
            CheckInStatus::Throttled => "throttled",
            CheckInStatus::Halted => "halted",
            CheckInStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for CheckInStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact reference handed to a device that was granted an update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateInfo {
    pub version: String,
    pub url: String,
    pub filename: String,
    pub hash: String,
    pub size: u64,
}

impl From<&Package> for UpdateInfo {
    fn from(pkg: &Package) -> Self {
        Self {
            version: pkg.version.clone(),
            url: pkg.artifact.url.clone(),
            filename: pkg.artifact.filename.clone(),
            hash: pkg.artifact.hash.clone(),
            size: pkg.artifact.size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInResponse {
    pub status: CheckInStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateInfo>,
}

impl From<&Decision> for CheckInResponse {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::NoUpdate => Self {
                status: CheckInStatus::NoUpdate,
                update: None,
            },
            Decision::Denied(reason) => Self {
                status: match reason {
                    DenyReason::RolloutDisabled => CheckInStatus::Disabled,
                    DenyReason::RolloutHalted => CheckInStatus::Halted,
                    DenyReason::Throttled => CheckInStatus::Throttled,
                },
                update: None,
            },
            Decision::Granted { package, .. } => Self {
                status: CheckInStatus::Update,
                update: Some(UpdateInfo::from(package)),
            },
        }
    }
}

/// Event type or result as sent by clients: either a name or an Omaha code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WireCode {
    Code(u32),
    Name(String),
}

impl fmt::Display for WireCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireCode::Code(c) => write!(f, "{c}"),
            WireCode::Name(n) => f.write_str(n),
        }
    }
}

/// A device reporting progress on a granted update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRequest {
    pub instance_id: String,
    pub app_id: String,
    /// Package version the event is about.
    pub version: String,
    pub event_type: WireCode,
    pub result: WireCode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventAck {
    pub status: String,
}

impl EventAck {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
