//! Metrics collector: per-group decision and event counters.
//!
//! Counters are atomics; the map from group to counters sits behind an
//! async `RwLock` and is only write-locked the first time a group shows up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_omaha::CheckInStatus;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct GroupMetrics {
    update: AtomicU64,
    no_update: AtomicU64,
    throttled: AtomicU64,
    halted: AtomicU64,
    disabled: AtomicU64,
    events_ok: AtomicU64,
    events_failed: AtomicU64,
    rejected: AtomicU64,
}

impl GroupMetrics {
    fn check_in_counter(&self, status: CheckInStatus) -> &AtomicU64 {
        match status {
            CheckInStatus::Update => &self.update,
            CheckInStatus::NoUpdate => &self.no_update,
            CheckInStatus::Throttled => &self.throttled,
            CheckInStatus::Halted => &self.halted,
            CheckInStatus::Disabled => &self.disabled,
        }
    }
}

/// Point-in-time copy of one group's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupCounters {
    pub group_id: String,
    pub update: u64,
    pub no_update: u64,
    pub throttled: u64,
    pub halted: u64,
    pub disabled: u64,
    pub events_ok: u64,
    pub events_failed: u64,
    /// Requests that ended in an error response.
    pub rejected: u64,
}

impl GroupCounters {
    /// Check-in counts keyed by wire status, in a stable order.
    pub fn check_ins(&self) -> [(&'static str, u64); 5] {
        [
            (CheckInStatus::Update.as_str(), self.update),
            (CheckInStatus::NoUpdate.as_str(), self.no_update),
            (CheckInStatus::Throttled.as_str(), self.throttled),
            (CheckInStatus::Halted.as_str(), self.halted),
            (CheckInStatus::Disabled.as_str(), self.disabled),
        ]
    }
}

/// Process-local rollout counters, shared across request handlers.
#[derive(Clone, Default)]
pub struct RolloutMetrics {
    groups: Arc<RwLock<HashMap<String, Arc<GroupMetrics>>>>,
}

impl RolloutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    async fn group(&self, group_id: &str) -> Arc<GroupMetrics> {
        if let Some(m) = self.groups.read().await.get(group_id) {
            return Arc::clone(m);
        }
        let mut groups = self.groups.write().await;
        let m = groups.entry(group_id.to_string()).or_insert_with(|| {
            debug!(group = %group_id, "tracking metrics for group");
            Arc::new(GroupMetrics::default())
        });
        Arc::clone(m)
    }

    pub async fn record_check_in(&self, group_id: &str, status: CheckInStatus) {
        self.group(group_id)
            .await
            .check_in_counter(status)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count an event report; `success` is the reported result.
    pub async fn record_event(&self, group_id: &str, success: bool) {
        let m = self.group(group_id).await;
        if success {
            m.events_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            m.events_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn record_rejected(&self, group_id: &str) {
        self.group(group_id)
            .await
            .rejected
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of all counters, sorted by group.
    pub async fn snapshot(&self) -> Vec<GroupCounters> {
        let groups = self.groups.read().await;
        let mut out: Vec<GroupCounters> = groups
            .iter()
            .map(|(id, m)| GroupCounters {
                group_id: id.clone(),
                update: m.update.load(Ordering::Relaxed),
                no_update: m.no_update.load(Ordering::Relaxed),
                throttled: m.throttled.load(Ordering::Relaxed),
                halted: m.halted.load(Ordering::Relaxed),
                disabled: m.disabled.load(Ordering::Relaxed),
                events_ok: m.events_ok.load(Ordering::Relaxed),
                events_failed: m.events_failed.load(Ordering::Relaxed),
                rejected: m.rejected.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_per_group_and_status() {
        let metrics = RolloutMetrics::new();
        metrics.record_check_in("prod", CheckInStatus::Update).await;
        metrics.record_check_in("prod", CheckInStatus::Update).await;
        metrics.record_check_in("prod", CheckInStatus::Throttled).await;
        metrics.record_check_in("beta", CheckInStatus::NoUpdate).await;
        metrics.record_event("prod", false).await;
        metrics.record_rejected("beta").await;

        let snap = metrics.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].group_id, "beta");
        assert_eq!(snap[0].no_update, 1);
        assert_eq!(snap[0].rejected, 1);
        assert_eq!(snap[1].update, 2);
        assert_eq!(snap[1].throttled, 1);
        assert_eq!(snap[1].events_failed, 1);
    }

    #[tokio::test]
    async fn empty_snapshot() {
        assert!(RolloutMetrics::new().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_recording() {
        let metrics = RolloutMetrics::new();
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let m = metrics.clone();
            tasks.push(tokio::spawn(async move {
                m.record_check_in("prod", CheckInStatus::Halted).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(metrics.snapshot().await[0].halted, 50);
    }
}
