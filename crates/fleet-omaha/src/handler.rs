//! Protocol handler: check-ins and event reports.
//!
//! Each request reads a snapshot (group context, instance row, ledger),
//! computes the outcome with the pure evaluator or lifecycle, and commits
//! it in one store transaction. A commit that loses to a concurrent writer
//! of the same instance row is retried from a fresh snapshot; if that keeps
//! happening the request fails as transient and the device retries later.

use fleet_core::{unix_now, versions_match, Arch};
use fleet_rollout::{
    apply_event, breaker_tripped, evaluate, Decision, DenyReason, EventKind, EventResult,
    InstanceView, Transition,
};
use fleet_state::{
    Activity, GrantCommit, GrantRequest, Group, GroupContext, InstanceRecord, InstanceStatus,
    LedgerSnapshot, Package, StateStore, StatisticsLedger,
};
use tracing::{debug, info, warn};

use crate::error::{HandlerError, HandlerResult};
use crate::protocol::{CheckInRequest, CheckInResponse, EventAck, EventRequest};

/// What an accepted event report did.
#[derive(Debug, Clone, PartialEq)]
pub struct EventReceipt {
    pub group_id: String,
    pub transition: Transition,
}

impl EventReceipt {
    pub fn ack(&self) -> EventAck {
        EventAck::ok()
    }
}

/// Stateless front for the rollout engine. Cheap to clone and share.
#[derive(Clone)]
pub struct ProtocolHandler {
    store: StateStore,
    ledger: StatisticsLedger,
    stale_write_retries: u32,
}

impl ProtocolHandler {
    pub fn new(store: StateStore, ledger: StatisticsLedger) -> Self {
        Self {
            store,
            ledger,
            stale_write_retries: 1,
        }
    }

    /// How many times a stale instance write is recomputed before giving up.
    pub fn with_stale_write_retries(mut self, retries: u32) -> Self {
        self.stale_write_retries = retries;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn ledger(&self) -> &StatisticsLedger {
        &self.ledger
    }

    // ── Check-in ───────────────────────────────────────────────────

    pub fn handle_check_in(&self, req: &CheckInRequest) -> HandlerResult<CheckInResponse> {
        self.handle_check_in_at(req, unix_now())
    }

    /// Check-in evaluated at an explicit clock reading.
    pub fn handle_check_in_at(
        &self,
        req: &CheckInRequest,
        now: u64,
    ) -> HandlerResult<CheckInResponse> {
        let arch = validate_check_in(req)?;
        let decision = self.with_retries(&req.instance_id, || {
            self.try_check_in(req, arch, now)
        })?;
        Ok(CheckInResponse::from(&decision))
    }

    fn try_check_in(&self, req: &CheckInRequest, arch: Arch, now: u64) -> HandlerResult<Decision> {
        let ctx = self.load_group(&req.group_id, &req.app_id)?;
        let group = &ctx.group;
        let target = servable_package(&ctx, arch);

        let existing = self.store.get_instance(&req.app_id, &req.instance_id)?;
        let expected = existing.as_ref().map(|r| r.revision);
        let mut record = existing.unwrap_or_else(|| {
            InstanceRecord::first_seen(&req.app_id, &req.instance_id, &req.group_id, &req.version, now)
        });
        if record.group_id != req.group_id {
            debug!(
                instance = %req.instance_id,
                from = %record.group_id,
                to = %req.group_id,
                "instance changed group; grant dropped"
            );
            record.group_id = req.group_id.clone();
            record.granted_version = None;
            record.granted_at = None;
            if record.status.is_in_flight() || record.status == InstanceStatus::Errored {
                record.status = InstanceStatus::Unknown;
            }
        }
        record.version = req.version.clone();
        record.last_seen = now;
        if req.ip.is_some() {
            record.last_ip = req.ip.clone();
        }

        let snapshot = self.ledger.snapshot(group, now)?;
        self.sync_breaker(group, &snapshot, target.map(|p| p.version.as_str()), now);

        let decision = evaluate(
            &group.policy,
            &snapshot,
            &InstanceView::from_record(&record),
            target,
            now,
        );

        let grant = match &decision {
            Decision::Granted {
                package,
                consumes_slot,
            } => Some((package.version.clone(), *consumes_slot)),
            _ => None,
        };

        let Some((version, consumes_slot)) = grant else {
            if decision == Decision::NoUpdate {
                record.status = settle_no_update(record.status, &record.version, target);
            }
            self.store.put_instance_checked(&record, expected)?;
            debug!(
                group = %group.id,
                instance = %req.instance_id,
                status = decision.status(),
                "check-in answered"
            );
            return Ok(decision);
        };

        let mut granted = record.clone();
        granted.status = InstanceStatus::UpdateGranted;
        if consumes_slot || record.status == InstanceStatus::Errored {
            granted.granted_at = Some(now);
        }
        granted.granted_version = Some(version.clone());

        let commit = self.ledger.commit_grant(GrantRequest {
            group,
            now,
            consume_slot: consumes_slot,
            instance: &granted,
            expected_revision: expected,
        })?;

        match commit {
            GrantCommit::Committed(_) => {
                info!(
                    group = %group.id,
                    instance = %req.instance_id,
                    version = %version,
                    consumes_slot,
                    "update granted"
                );
                Ok(decision)
            }
            GrantCommit::Throttled => {
                debug!(group = %group.id, instance = %req.instance_id, "grant lost the reservation race");
                self.store.put_instance_checked(&record, expected)?;
                Ok(Decision::Denied(DenyReason::Throttled))
            }
        }
    }

    // ── Events ─────────────────────────────────────────────────────

    pub fn handle_event(&self, req: &EventRequest) -> HandlerResult<EventReceipt> {
        self.handle_event_at(req, unix_now())
    }

    /// Event report applied at an explicit clock reading.
    pub fn handle_event_at(&self, req: &EventRequest, now: u64) -> HandlerResult<EventReceipt> {
        let (event, result) = parse_event(req)?;
        self.with_retries(&req.instance_id, || self.try_event(req, event, result, now))
    }

    fn try_event(
        &self,
        req: &EventRequest,
        event: EventKind,
        result: EventResult,
        now: u64,
    ) -> HandlerResult<EventReceipt> {
        let record = self
            .store
            .get_instance(&req.app_id, &req.instance_id)?
            .ok_or_else(|| {
                HandlerError::NotFound(format!(
                    "instance {} of application {}",
                    req.instance_id, req.app_id
                ))
            })?;

        let transition = apply_event(
            record.status,
            record.granted_version.as_deref(),
            &req.version,
            event,
            result,
        )
        .inspect_err(|e| {
            warn!(instance = %req.instance_id, error = %e, "rejected event report");
        })?;

        let group = self
            .store
            .get_group(&record.group_id)?
            .ok_or_else(|| HandlerError::NotFound(format!("group {}", record.group_id)))?;

        let mut next = record.clone();
        next.status = transition.next;
        next.last_seen = now;
        if transition.next == InstanceStatus::Complete {
            if let Some(granted) = &record.granted_version {
                next.version = granted.clone();
            }
        }

        self.ledger
            .commit_event(&group, &next, Some(record.revision), transition.outcome, now)?;
        debug!(
            group = %group.id,
            instance = %req.instance_id,
            %event,
            status = ?transition.next,
            "event applied"
        );

        if transition.outcome.is_some() {
            let snapshot = self.ledger.snapshot(&group, now)?;
            self.sync_breaker(&group, &snapshot, Some(&req.version), now);
        }
        Ok(EventReceipt {
            group_id: group.id,
            transition,
        })
    }

    // ── Introspection ──────────────────────────────────────────────

    /// What a check-in from `instance_id` would get right now, without
    /// writing anything. `version` overrides the instance's stored version;
    /// it is required for an instance that has never checked in.
    pub fn dry_run(
        &self,
        group_id: &str,
        instance_id: &str,
        version: Option<&str>,
        now: u64,
    ) -> HandlerResult<Decision> {
        let ctx = self
            .store
            .get_group_context(group_id)?
            .ok_or_else(|| HandlerError::NotFound(format!("group {group_id}")))?;
        let record = self
            .store
            .get_instance(&ctx.group.application_id, instance_id)?;
        let view = match (&record, version) {
            (Some(r), Some(v)) => InstanceView {
                version: v,
                ..InstanceView::from_record(r)
            },
            (Some(r), None) => InstanceView::from_record(r),
            (None, Some(v)) => InstanceView::fresh(v),
            (None, None) => {
                return Err(HandlerError::NotFound(format!(
                    "instance {instance_id} has not checked in"
                )))
            }
        };
        let snapshot = self.ledger.snapshot(&ctx.group, now)?;
        Ok(evaluate(
            &ctx.group.policy,
            &snapshot,
            &view,
            ctx.package.as_ref(),
            now,
        ))
    }

    // ── Internals ──────────────────────────────────────────────────

    fn with_retries<T>(
        &self,
        instance_id: &str,
        mut attempt_fn: impl FnMut() -> HandlerResult<T>,
    ) -> HandlerResult<T> {
        let mut attempt = 0;
        loop {
            match attempt_fn() {
                Err(e) if e.is_retryable() && attempt < self.stale_write_retries => {
                    attempt += 1;
                    debug!(instance = %instance_id, attempt, error = %e, "stale write, recomputing");
                }
                Err(e) if e.is_retryable() => {
                    warn!(instance = %instance_id, error = %e, "stale write persisted, giving up");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    fn load_group(&self, group_id: &str, app_id: &str) -> HandlerResult<GroupContext> {
        let ctx = self
            .store
            .get_group_context(group_id)?
            .ok_or_else(|| HandlerError::NotFound(format!("group {group_id}")))?;
        if ctx.group.application_id != app_id {
            return Err(HandlerError::Malformed(format!(
                "group {group_id} does not belong to application {app_id}"
            )));
        }
        Ok(ctx)
    }

    /// Persist a halt or resume when the breaker's view changed.
    fn sync_breaker(&self, group: &Group, snapshot: &LedgerSnapshot, version: Option<&str>, now: u64) {
        let tripped = breaker_tripped(&group.policy, snapshot);
        if tripped == snapshot.halted {
            return;
        }
        let activity = Activity::rollout_transition(group, version, tripped, now);
        if let Err(e) = self.ledger.set_halted(group, tripped, &activity) {
            warn!(group = %group.id, error = %e, "failed to persist breaker transition");
        }
    }
}

fn validate_check_in(req: &CheckInRequest) -> HandlerResult<Arch> {
    for (field, value) in [
        ("instance_id", &req.instance_id),
        ("app_id", &req.app_id),
        ("group_id", &req.group_id),
        ("version", &req.version),
    ] {
        if value.trim().is_empty() {
            return Err(HandlerError::Malformed(format!("{field} is required")));
        }
    }
    req.arch
        .parse::<Arch>()
        .map_err(|e| HandlerError::Malformed(e.to_string()))
}

fn parse_event(req: &EventRequest) -> HandlerResult<(EventKind, EventResult)> {
    for (field, value) in [
        ("instance_id", &req.instance_id),
        ("app_id", &req.app_id),
        ("version", &req.version),
    ] {
        if value.trim().is_empty() {
            return Err(HandlerError::Malformed(format!("{field} is required")));
        }
    }
    let event = req.event_type.to_string().parse::<EventKind>()?;
    let result = req.result.to_string().parse::<EventResult>()?;
    Ok((event, result))
}

/// The channel's package, unless the device's arch rules it out.
fn servable_package(ctx: &GroupContext, arch: Arch) -> Option<&Package> {
    let pkg = ctx.package.as_ref()?;
    if arch != Arch::All && ctx.channel.arch != Arch::All && ctx.channel.arch != arch {
        return None;
    }
    Some(pkg)
}

/// Status after a `NoUpdate` answer.
fn settle_no_update(
    status: InstanceStatus,
    reported: &str,
    target: Option<&Package>,
) -> InstanceStatus {
    match target {
        Some(pkg) if versions_match(&pkg.version, reported) => InstanceStatus::UpToDate,
        _ => match status {
            InstanceStatus::Unknown | InstanceStatus::Complete => InstanceStatus::UpToDate,
            other => other,
        },
    }
}
