//! Instance lifecycle: the per-device update state machine.
//!
//! ```text
//! Unknown ─► UpToDate ─► UpdateGranted ─► Downloading ─► Installing ─► Complete
//!                              │               │              │
//!                              └───────────────┴──────────────┴──────► Errored
//! ```
//!
//! Grants are made by the check-in path. Everything after `UpdateGranted`
//! is driven by event reports, which only apply to the version that was
//! granted and only move forward.

use std::fmt;
use std::str::FromStr;

use fleet_core::versions_match;
use fleet_state::InstanceStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Omaha event types Fleetgate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    DownloadStarted,
    DownloadFinished,
    /// Payload installed, pending reboot.
    InstallStarted,
    InstallComplete,
    InstallError,
}

impl EventKind {
    /// Map an Omaha numeric event type.
    pub fn from_omaha_code(code: u32) -> Option<Self> {
        match code {
            13 => Some(EventKind::DownloadStarted),
            14 => Some(EventKind::DownloadFinished),
            3 => Some(EventKind::InstallStarted),
            800 => Some(EventKind::InstallComplete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DownloadStarted => "download-started",
            EventKind::DownloadFinished => "download-finished",
            EventKind::InstallStarted => "install-started",
            EventKind::InstallComplete => "install-complete",
            EventKind::InstallError => "install-error",
        }
    }
}

impl FromStr for EventKind {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u32>() {
            return EventKind::from_omaha_code(code)
                .ok_or_else(|| LifecycleError::UnknownEvent(s.to_string()));
        }
        match s {
            "download-started" => Ok(EventKind::DownloadStarted),
            "download-finished" => Ok(EventKind::DownloadFinished),
            "install-started" => Ok(EventKind::InstallStarted),
            "install-complete" => Ok(EventKind::InstallComplete),
            "install-error" => Ok(EventKind::InstallError),
            _ => Err(LifecycleError::UnknownEvent(s.to_string())),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result attached to an event report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventResult {
    Success,
    Error,
}

impl FromStr for EventResult {
    type Err = LifecycleError;

    /// Accepts names and the Omaha codes `1`/`2` (success) and `0` (error).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" | "1" | "2" => Ok(EventResult::Success),
            "error" | "0" => Ok(EventResult::Error),
            other => Err(LifecycleError::UnknownResult(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("unexpected {event} event for version {version} while {status:?}: {reason}")]
    UnexpectedEvent {
        event: EventKind,
        version: String,
        status: InstanceStatus,
        reason: &'static str,
    },

    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    #[error("unknown event result: {0}")]
    UnknownResult(String),
}

/// Where an accepted event moves the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: InstanceStatus,
    /// `Some(success)` for terminal transitions, which feed the failure window.
    pub outcome: Option<bool>,
}

/// Progress rank of in-flight states; events never move backwards.
fn stage(status: InstanceStatus) -> Option<u8> {
    match status {
        InstanceStatus::UpdateGranted => Some(0),
        InstanceStatus::Downloading => Some(1),
        InstanceStatus::Installing => Some(2),
        _ => None,
    }
}

/// Validate an event report against the instance's current state.
///
/// Rejected events leave the caller's state untouched: this function only
/// computes the next status.
pub fn apply_event(
    current: InstanceStatus,
    granted_version: Option<&str>,
    event_version: &str,
    event: EventKind,
    result: EventResult,
) -> Result<Transition, LifecycleError> {
    let unexpected = |reason: &'static str| LifecycleError::UnexpectedEvent {
        event,
        version: event_version.to_string(),
        status: current,
        reason,
    };

    match granted_version {
        Some(granted) if versions_match(granted, event_version) => {}
        _ => return Err(unexpected("version was never granted")),
    }

    let Some(current_stage) = stage(current) else {
        return Err(unexpected("no update in flight"));
    };

    if result == EventResult::Error || event == EventKind::InstallError {
        return Ok(Transition {
            next: InstanceStatus::Errored,
            outcome: Some(false),
        });
    }

    let next = match event {
        EventKind::DownloadStarted | EventKind::DownloadFinished => InstanceStatus::Downloading,
        EventKind::InstallStarted => InstanceStatus::Installing,
        EventKind::InstallComplete => {
            return Ok(Transition {
                next: InstanceStatus::Complete,
                outcome: Some(true),
            });
        }
        EventKind::InstallError => InstanceStatus::Errored,
    };

    match stage(next) {
        Some(next_stage) if next_stage >= current_stage => Ok(Transition {
            next,
            outcome: None,
        }),
        _ => Err(unexpected("stage regression")),
    }
}
