//! Statistics ledger: per-period grant counters and trailing outcomes.
//!
//! Every mutating operation runs inside a single redb write transaction.
//! Because redb serialises writers, the check-then-increment in
//! [`StatisticsLedger::try_reserve_grant`] is linearizable: concurrent
//! callers for the same group can never push a period past its cap.
//!
//! Period counters are keyed by `(group, period_start)`; a new period starts
//! from zero and closed periods are never rewritten.

use redb::WriteTransaction;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{append_activity_in, cas_instance, map_err, read_row, write_row, StateStore};
use crate::tables::{FAILURE_WINDOWS, LEDGER_PERIODS};
use crate::types::*;
use crate::window::FailureWindow;

/// Inputs for committing a check-in decision atomically.
#[derive(Debug, Clone, Copy)]
pub struct GrantRequest<'a> {
    pub group: &'a Group,
    pub now: u64,
    /// Whether this grant takes a slot from the period counter.
    pub consume_slot: bool,
    pub instance: &'a InstanceRecord,
    /// Revision of the instance row the decision was computed from.
    pub expected_revision: Option<u64>,
}

/// Result of [`StatisticsLedger::commit_grant`].
#[derive(Debug, Clone, PartialEq)]
pub enum GrantCommit {
    /// Slot (if any) reserved and instance row written.
    Committed(InstanceRecord),
    /// The period filled up first. Nothing was written.
    Throttled,
}

/// Durable, concurrency-safe counters consulted by the evaluator.
#[derive(Clone)]
pub struct StatisticsLedger {
    store: StateStore,
}

impl StatisticsLedger {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Atomically take one grant slot for the group's current period.
    ///
    /// Returns `false` when the period's cap has been reached.
    pub fn try_reserve_grant(&self, group: &Group, now: u64) -> StateResult<bool> {
        let txn = self.store.begin_write()?;
        let reserved = reserve_in(&txn, group, now)?;
        if reserved {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(reserved)
    }

    /// Reserve a slot (when asked) and write the instance row in one
    /// transaction. A stale instance revision aborts with
    /// [`crate::StateError::Conflict`]; a full period aborts with
    /// [`GrantCommit::Throttled`]. Either way nothing is written.
    pub fn commit_grant(&self, req: GrantRequest<'_>) -> StateResult<GrantCommit> {
        let txn = self.store.begin_write()?;
        let stored = match cas_instance(&txn, req.instance, req.expected_revision) {
            Ok(stored) => stored,
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };
        if req.consume_slot {
            let reserved = match reserve_in(&txn, req.group, req.now) {
                Ok(r) => r,
                Err(e) => {
                    txn.abort().map_err(map_err!(Transaction))?;
                    return Err(e);
                }
            };
            if !reserved {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(group = %req.group.id, instance = %req.instance.id, "grant lost to a full period");
                return Ok(GrantCommit::Throttled);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(GrantCommit::Committed(stored))
    }

    /// Append one outcome to the group's trailing window.
    pub fn record_outcome(
        &self,
        group: &Group,
        success: bool,
        now: u64,
    ) -> StateResult<FailureWindow> {
        let txn = self.store.begin_write()?;
        let window = record_in(&txn, group, success, now)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(window)
    }

    /// Write the instance row after an event report and, for terminal
    /// events, record the outcome, all in one transaction.
    pub fn commit_event(
        &self,
        group: &Group,
        instance: &InstanceRecord,
        expected_revision: Option<u64>,
        outcome: Option<bool>,
        now: u64,
    ) -> StateResult<InstanceRecord> {
        let txn = self.store.begin_write()?;
        let stored = match cas_instance(&txn, instance, expected_revision) {
            Ok(stored) => stored,
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };
        if let Some(success) = outcome {
            record_in(&txn, group, success, now)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// Current period counter and trailing window totals for a group.
    pub fn snapshot(&self, group: &Group, now: u64) -> StateResult<LedgerSnapshot> {
        let period_start = group.policy.period_start(now);
        let granted = self
            .store
            .get::<LedgerEntry>(LEDGER_PERIODS, &ledger_key(&group.id, period_start))?
            .map_or(0, |e| e.granted);
        let window = self.window(group)?;
        Ok(LedgerSnapshot::from_parts(
            &group.id,
            period_start,
            granted,
            &window,
            now,
        ))
    }

    /// The group's trailing window, shaped for its current policy.
    pub fn window(&self, group: &Group) -> StateResult<FailureWindow> {
        let mut window = self
            .store
            .get::<FailureWindow>(FAILURE_WINDOWS, &group.id)?
            .unwrap_or_else(|| FailureWindow::new(group.policy.failure_window_secs));
        window.align(group.policy.failure_window_secs);
        Ok(window)
    }

    /// Persist the breaker state. When it flips, `activity` is appended in
    /// the same transaction. Returns whether a transition happened.
    pub fn set_halted(
        &self,
        group: &Group,
        halted: bool,
        activity: &Activity,
    ) -> StateResult<bool> {
        let txn = self.store.begin_write()?;
        let changed = {
            let mut table = txn.open_table(FAILURE_WINDOWS).map_err(map_err!(Table))?;
            let mut window = read_row::<FailureWindow>(&table, &group.id)?
                .unwrap_or_else(|| FailureWindow::new(group.policy.failure_window_secs));
            if window.halted == halted {
                false
            } else {
                window.halted = halted;
                write_row(&mut table, &group.id, &window)?;
                true
            }
        };
        if !changed {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(false);
        }
        append_activity_in(&txn, activity)?;
        txn.commit().map_err(map_err!(Transaction))?;
        if halted {
            info!(group = %group.id, "rollout halted by safe mode");
        } else {
            info!(group = %group.id, "rollout resumed");
        }
        Ok(true)
    }

    /// Clear a group's recorded outcomes and breaker flag. Returns whether
    /// the group was halted before the reset.
    pub fn reset_failures(&self, group: &Group, now: u64) -> StateResult<bool> {
        let txn = self.store.begin_write()?;
        let was_halted = {
            let mut table = txn.open_table(FAILURE_WINDOWS).map_err(map_err!(Table))?;
            let was_halted = read_row::<FailureWindow>(&table, &group.id)?
                .map(|w| w.halted)
                .unwrap_or(false);
            let window = FailureWindow::new(group.policy.failure_window_secs);
            write_row(&mut table, &group.id, &window)?;
            was_halted
        };
        if was_halted {
            append_activity_in(&txn, &Activity::rollout_transition(group, None, false, now))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(group = %group.id, was_halted, "failure window reset");
        Ok(was_halted)
    }
}

/// Check-and-increment the group's current period counter.
fn reserve_in(txn: &WriteTransaction, group: &Group, now: u64) -> StateResult<bool> {
    let period_start = group.policy.period_start(now);
    let key = ledger_key(&group.id, period_start);
    let mut table = txn.open_table(LEDGER_PERIODS).map_err(map_err!(Table))?;
    let mut entry = read_row::<LedgerEntry>(&table, &key)?.unwrap_or_else(|| LedgerEntry {
        group_id: group.id.clone(),
        period_start,
        period_secs: group.policy.period_interval_secs,
        granted: 0,
    });
    if entry.granted >= group.policy.max_updates_per_period {
        return Ok(false);
    }
    entry.granted += 1;
    write_row(&mut table, &key, &entry)?;
    debug!(group = %group.id, period_start, granted = entry.granted, "grant slot reserved");
    Ok(true)
}

fn record_in(
    txn: &WriteTransaction,
    group: &Group,
    success: bool,
    now: u64,
) -> StateResult<FailureWindow> {
    let mut table = txn.open_table(FAILURE_WINDOWS).map_err(map_err!(Table))?;
    let mut window = read_row::<FailureWindow>(&table, &group.id)?
        .unwrap_or_else(|| FailureWindow::new(group.policy.failure_window_secs));
    window.align(group.policy.failure_window_secs);
    window.record(success, now);
    write_row(&mut table, &group.id, &window)?;
    debug!(group = %group.id, success, "outcome recorded");
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn capped_group(max: u32) -> Group {
        let mut group = test_group("prod", "app", "stable");
        group.policy.max_updates_per_period = max;
        group.policy.period_interval_secs = 3600;
        group
    }

    fn ledger() -> StatisticsLedger {
        StatisticsLedger::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn reserve_stops_at_cap() {
        let ledger = ledger();
        let group = capped_group(2);
        assert!(ledger.try_reserve_grant(&group, 7200).unwrap());
        assert!(ledger.try_reserve_grant(&group, 7300).unwrap());
        assert!(!ledger.try_reserve_grant(&group, 7400).unwrap());
        assert_eq!(ledger.snapshot(&group, 7400).unwrap().granted, 2);
    }

    #[test]
    fn new_period_starts_from_zero() {
        let ledger = ledger();
        let group = capped_group(1);
        assert!(ledger.try_reserve_grant(&group, 3600).unwrap());
        assert!(!ledger.try_reserve_grant(&group, 7199).unwrap());
        // Next hour.
        assert!(ledger.try_reserve_grant(&group, 7200).unwrap());
        let entries = ledger.store.list_ledger_entries("prod").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.granted == 1));
    }

    #[test]
    fn zero_cap_never_grants() {
        let ledger = ledger();
        assert!(!ledger.try_reserve_grant(&capped_group(0), 100).unwrap());
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        let ledger = ledger();
        let group = capped_group(10);
        let granted = Arc::new(AtomicU32::new(0));

        std::thread::scope(|s| {
            for _ in 0..100 {
                let ledger = ledger.clone();
                let group = group.clone();
                let granted = Arc::clone(&granted);
                s.spawn(move || {
                    if ledger.try_reserve_grant(&group, 5000).unwrap() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(granted.load(Ordering::SeqCst), 10);
        assert_eq!(ledger.snapshot(&group, 5000).unwrap().granted, 10);
    }

    #[test]
    fn commit_grant_writes_instance_and_slot() {
        let ledger = ledger();
        let group = capped_group(1);
        let rec = InstanceRecord::first_seen("app", "i-1", "prod", "1.0.0", 100);

        let commit = ledger
            .commit_grant(GrantRequest {
                group: &group,
                now: 100,
                consume_slot: true,
                instance: &rec,
                expected_revision: None,
            })
            .unwrap();
        assert!(matches!(commit, GrantCommit::Committed(ref r) if r.revision == 1));
        assert_eq!(ledger.snapshot(&group, 100).unwrap().granted, 1);
    }

    #[test]
    fn throttled_commit_has_no_partial_effects() {
        let ledger = ledger();
        let group = capped_group(0);
        let rec = InstanceRecord::first_seen("app", "i-1", "prod", "1.0.0", 100);

        let commit = ledger
            .commit_grant(GrantRequest {
                group: &group,
                now: 100,
                consume_slot: true,
                instance: &rec,
                expected_revision: None,
            })
            .unwrap();
        assert_eq!(commit, GrantCommit::Throttled);
        assert!(ledger.store.get_instance("app", "i-1").unwrap().is_none());
    }

    #[test]
    fn stale_commit_does_not_consume_slot() {
        let ledger = ledger();
        let group = capped_group(5);
        let rec = InstanceRecord::first_seen("app", "i-1", "prod", "1.0.0", 100);
        ledger.store.put_instance_checked(&rec, None).unwrap();

        let err = ledger
            .commit_grant(GrantRequest {
                group: &group,
                now: 100,
                consume_slot: true,
                instance: &rec,
                expected_revision: None,
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(ledger.snapshot(&group, 100).unwrap().granted, 0);
    }

    #[test]
    fn retry_grant_skips_counter() {
        let ledger = ledger();
        let group = capped_group(0);
        let rec = InstanceRecord::first_seen("app", "i-1", "prod", "1.0.0", 100);
        let commit = ledger
            .commit_grant(GrantRequest {
                group: &group,
                now: 100,
                consume_slot: false,
                instance: &rec,
                expected_revision: None,
            })
            .unwrap();
        assert!(matches!(commit, GrantCommit::Committed(_)));
        assert_eq!(ledger.snapshot(&group, 100).unwrap().granted, 0);
    }

    #[test]
    fn outcomes_feed_snapshot() {
        let ledger = ledger();
        let group = capped_group(1);
        ledger.record_outcome(&group, true, 1000).unwrap();
        ledger.record_outcome(&group, false, 1001).unwrap();
        ledger.record_outcome(&group, false, 1002).unwrap();

        let snap = ledger.snapshot(&group, 1002).unwrap();
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 2);
        assert!((snap.failure_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn set_halted_reports_transitions_once() {
        let ledger = ledger();
        let group = capped_group(1);
        let halt = Activity::rollout_transition(&group, Some("2.0.0"), true, 10);
        let resume = Activity::rollout_transition(&group, Some("2.0.0"), false, 20);

        assert!(ledger.set_halted(&group, true, &halt).unwrap());
        assert!(!ledger.set_halted(&group, true, &halt).unwrap());
        assert!(ledger.snapshot(&group, 10).unwrap().halted);
        assert!(ledger.set_halted(&group, false, &resume).unwrap());

        let kinds: Vec<_> = ledger
            .store
            .list_activity(10)
            .unwrap()
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, vec![ActivityKind::RolloutResumed, ActivityKind::RolloutHalted]);
    }

    #[test]
    fn reset_clears_window_and_resumes() {
        let ledger = ledger();
        let group = capped_group(1);
        ledger.record_outcome(&group, false, 1000).unwrap();
        let halt = Activity::rollout_transition(&group, None, true, 1000);
        ledger.set_halted(&group, true, &halt).unwrap();

        assert!(ledger.reset_failures(&group, 1001).unwrap());
        let snap = ledger.snapshot(&group, 1001).unwrap();
        assert_eq!(snap.failures, 0);
        assert!(!snap.halted);
        assert_eq!(
            ledger.store.list_activity(1).unwrap()[0].kind,
            ActivityKind::RolloutResumed
        );
    }

    #[test]
    fn commit_event_records_terminal_outcome() {
        let ledger = ledger();
        let group = capped_group(1);
        let rec = InstanceRecord::first_seen("app", "i-1", "prod", "1.0.0", 100);
        let stored = ledger.store.put_instance_checked(&rec, None).unwrap();

        let mut next = stored.clone();
        next.status = InstanceStatus::Errored;
        ledger
            .commit_event(&group, &next, Some(stored.revision), Some(false), 200)
            .unwrap();
        assert_eq!(ledger.snapshot(&group, 200).unwrap().failures, 1);

        // A stale event write records nothing.
        let err = ledger
            .commit_event(&group, &next, Some(stored.revision), Some(false), 201)
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(ledger.snapshot(&group, 201).unwrap().failures, 1);
    }
}
