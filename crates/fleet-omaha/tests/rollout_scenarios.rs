//! End-to-end rollout scenarios against an in-memory store.
//!
//! Each test seeds a catalog (one application, one amd64 channel, one
//! group) and drives the protocol handler the way devices would.

use std::collections::BTreeSet;
use std::sync::Mutex;

use fleet_core::Arch;
use fleet_omaha::{
    CheckInRequest, CheckInStatus, EventRequest, HandlerError, ProtocolHandler, WireCode,
};
use fleet_state::{
    ActivityKind, Application, ArtifactRef, Catalog, CatalogError, Channel, FailureThreshold,
    Group, InstanceStatus, Package, RolloutPolicy, StateStore, StatisticsLedger,
};

const HOUR: u64 = 3600;

struct Fixture {
    store: StateStore,
    catalog: Catalog,
    handler: ProtocolHandler,
}

impl Fixture {
    fn new(policy: RolloutPolicy) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let catalog = Catalog::new(store.clone());
        catalog
            .add_application(&Application {
                id: "coreos".into(),
                name: "CoreOS".into(),
                description: String::new(),
                created_at: 0,
            })
            .unwrap();
        catalog.add_package(&package("pkg-1", "1.0.0")).unwrap();
        catalog.add_package(&package("pkg-2", "2.0.0")).unwrap();
        catalog
            .add_channel(&Channel {
                id: "stable".into(),
                name: "stable".into(),
                application_id: "coreos".into(),
                arch: Arch::Amd64,
                package_id: Some("pkg-2".into()),
                created_at: 0,
            })
            .unwrap();
        catalog
            .add_group(&Group {
                id: "prod".into(),
                name: "Production".into(),
                application_id: "coreos".into(),
                channel_id: "stable".into(),
                policy,
                created_at: 0,
            })
            .unwrap();
        let handler = ProtocolHandler::new(store.clone(), StatisticsLedger::new(store.clone()));
        Self {
            store,
            catalog,
            handler,
        }
    }

    fn group(&self) -> Group {
        self.store.get_group("prod").unwrap().unwrap()
    }

    fn check_in(&self, instance: &str, version: &str, now: u64) -> CheckInStatus {
        self.handler
            .handle_check_in_at(&check_in_req(instance, version), now)
            .unwrap()
            .status
    }

    fn event(&self, instance: &str, event: &str, result: &str, now: u64) -> Result<(), HandlerError> {
        self.handler
            .handle_event_at(
                &EventRequest {
                    instance_id: instance.into(),
                    app_id: "coreos".into(),
                    version: "2.0.0".into(),
                    event_type: WireCode::Name(event.into()),
                    result: WireCode::Name(result.into()),
                },
                now,
            )
            .map(|_| ())
    }

    fn granted_this_period(&self, now: u64) -> u32 {
        self.handler.ledger().snapshot(&self.group(), now).unwrap().granted
    }
}

fn package(id: &str, version: &str) -> Package {
    Package {
        id: id.into(),
        application_id: "coreos".into(),
        arch: Arch::Amd64,
        version: version.into(),
        artifact: ArtifactRef {
            url: "https://update.example.com/coreos".into(),
            filename: format!("coreos-{version}.gz"),
            hash: "0f".repeat(32),
            size: 4096,
        },
        channels_blacklist: BTreeSet::new(),
        created_at: 0,
    }
}

fn check_in_req(instance: &str, version: &str) -> CheckInRequest {
    CheckInRequest {
        instance_id: instance.into(),
        app_id: "coreos".into(),
        group_id: "prod".into(),
        version: version.into(),
        arch: "amd64".into(),
        ip: None,
    }
}

fn capped(max: u32) -> RolloutPolicy {
    RolloutPolicy {
        max_updates_per_period: max,
        period_interval_secs: HOUR,
        ..Default::default()
    }
}

#[test]
fn third_instance_in_the_hour_is_throttled() {
    let fx = Fixture::new(capped(2));
    assert_eq!(fx.check_in("a", "1.0.0", 10), CheckInStatus::Update);
    assert_eq!(fx.check_in("b", "1.0.0", 20), CheckInStatus::Update);
    assert_eq!(fx.check_in("c", "1.0.0", 30), CheckInStatus::Throttled);
    assert_eq!(fx.granted_this_period(30), 2);

    let c = fx.store.get_instance("coreos", "c").unwrap().unwrap();
    assert_eq!(c.status, InstanceStatus::Unknown);
    assert!(c.granted_version.is_none());
}

#[test]
fn throttled_instance_gets_slot_next_period() {
    let fx = Fixture::new(capped(1));
    assert_eq!(fx.check_in("a", "1.0.0", 100), CheckInStatus::Update);
    assert_eq!(fx.check_in("b", "1.0.0", 200), CheckInStatus::Throttled);
    assert_eq!(fx.check_in("b", "1.0.0", HOUR + 5), CheckInStatus::Update);
    assert_eq!(fx.granted_this_period(HOUR + 5), 1);
}

#[test]
fn up_to_date_instance_never_granted() {
    let fx = Fixture::new(capped(0));
    assert_eq!(fx.check_in("a", "2.0.0", 10), CheckInStatus::NoUpdate);
    let a = fx.store.get_instance("coreos", "a").unwrap().unwrap();
    assert_eq!(a.status, InstanceStatus::UpToDate);
}

#[test]
fn install_error_is_retried_without_new_slot() {
    let fx = Fixture::new(capped(1));
    assert_eq!(fx.check_in("a", "1.0.0", 10), CheckInStatus::Update);
    fx.event("a", "download-started", "success", 20).unwrap();
    fx.event("a", "install-error", "error", 30).unwrap();

    let group = fx.group();
    let snap = fx.handler.ledger().snapshot(&group, 30).unwrap();
    assert_eq!(snap.failures, 1);

    // The cap is used up, yet the errored instance is offered the same package.
    assert_eq!(fx.check_in("b", "1.0.0", 40), CheckInStatus::Throttled);
    let resp = fx
        .handler
        .handle_check_in_at(&check_in_req("a", "1.0.0"), 50)
        .unwrap();
    assert_eq!(resp.status, CheckInStatus::Update);
    assert_eq!(resp.update.unwrap().version, "2.0.0");

    let snap = fx.handler.ledger().snapshot(&group, 50).unwrap();
    assert_eq!(snap.granted, 1);
    assert_eq!(snap.failures, 1);

    // The retry can run to completion.
    fx.event("a", "800", "1", 60).unwrap();
    let a = fx.store.get_instance("coreos", "a").unwrap().unwrap();
    assert_eq!(a.status, InstanceStatus::Complete);
}

#[test]
fn abandoned_grant_consumes_a_fresh_slot() {
    let mut policy = capped(2);
    policy.update_timeout_secs = 600;
    let fx = Fixture::new(policy);

    assert_eq!(fx.check_in("a", "1.0.0", 100), CheckInStatus::Update);
    // Still inside the timeout: re-offered for free.
    assert_eq!(fx.check_in("a", "1.0.0", 500), CheckInStatus::Update);
    assert_eq!(fx.granted_this_period(500), 1);
    // Past it: a new grant, and the old slot is not refunded.
    assert_eq!(fx.check_in("a", "1.0.0", 800), CheckInStatus::Update);
    assert_eq!(fx.granted_this_period(800), 2);
}

#[test]
fn safe_mode_halts_then_recovers_through_successes() {
    let mut policy = capped(100);
    policy.safe_mode = true;
    policy.failure_threshold = FailureThreshold::Ratio(0.5);
    let fx = Fixture::new(policy);

    for id in ["a", "b", "c"] {
        assert_eq!(fx.check_in(id, "1.0.0", 10), CheckInStatus::Update);
    }
    fx.event("a", "install-error", "error", 20).unwrap();

    assert_eq!(fx.check_in("d", "1.0.0", 30), CheckInStatus::Halted);
    assert_eq!(
        fx.store.list_activity(1).unwrap()[0].kind,
        ActivityKind::RolloutHalted
    );

    fx.event("b", "install-complete", "success", 40).unwrap();
    fx.event("c", "install-complete", "success", 50).unwrap();

    assert_eq!(fx.check_in("d", "1.0.0", 60), CheckInStatus::Update);
    let kinds: Vec<_> = fx
        .store
        .list_activity(10)
        .unwrap()
        .into_iter()
        .map(|a| a.kind)
        .collect();
    assert_eq!(kinds, vec![ActivityKind::RolloutResumed, ActivityKind::RolloutHalted]);
}

#[test]
fn manual_reset_resumes_halted_group() {
    let mut policy = capped(100);
    policy.safe_mode = true;
    policy.failure_threshold = FailureThreshold::Count(0);
    let fx = Fixture::new(policy);

    assert_eq!(fx.check_in("a", "1.0.0", 10), CheckInStatus::Update);
    fx.event("a", "install-error", "error", 20).unwrap();
    assert_eq!(fx.check_in("b", "1.0.0", 30), CheckInStatus::Halted);

    assert!(fx.handler.ledger().reset_failures(&fx.group(), 40).unwrap());
    assert_eq!(fx.check_in("b", "1.0.0", 50), CheckInStatus::Update);
}

#[test]
fn disabled_group_denies() {
    let mut policy = capped(100);
    policy.updates_enabled = false;
    let fx = Fixture::new(policy);
    assert_eq!(fx.check_in("a", "1.0.0", 10), CheckInStatus::Disabled);
}

#[test]
fn event_for_ungranted_version_changes_nothing() {
    let fx = Fixture::new(capped(10));
    assert_eq!(fx.check_in("a", "1.0.0", 10), CheckInStatus::Update);
    let before = fx.store.get_instance("coreos", "a").unwrap().unwrap();

    let err = fx
        .handler
        .handle_event_at(
            &EventRequest {
                instance_id: "a".into(),
                app_id: "coreos".into(),
                version: "9.9.9".into(),
                event_type: WireCode::Code(13),
                result: WireCode::Code(1),
            },
            20,
        )
        .unwrap_err();
    assert!(matches!(err, HandlerError::UnexpectedEvent(_)));

    let after = fx.store.get_instance("coreos", "a").unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(fx.handler.ledger().snapshot(&fx.group(), 20).unwrap().outcomes(), 0);
}

#[test]
fn event_from_unknown_instance_is_not_found() {
    let fx = Fixture::new(capped(10));
    let err = fx.event("ghost", "download-started", "success", 10).unwrap_err();
    assert!(matches!(err, HandlerError::NotFound(_)));
}

#[test]
fn unknown_event_type_is_malformed() {
    let fx = Fixture::new(capped(10));
    fx.check_in("a", "1.0.0", 10);
    let err = fx.event("a", "reboot", "success", 20).unwrap_err();
    assert!(matches!(err, HandlerError::Malformed(_)));
}

#[test]
fn blacklisted_assignment_keeps_serving_old_package() {
    let fx = Fixture::new(capped(10));
    let mut pkg = package("pkg-3", "3.0.0");
    pkg.channels_blacklist.insert("stable".into());
    fx.catalog.add_package(&pkg).unwrap();

    let err = fx
        .catalog
        .update_channel_package("stable", Some("pkg-3"), 5)
        .unwrap_err();
    assert!(matches!(err, CatalogError::BlacklistedChannel));

    let resp = fx
        .handler
        .handle_check_in_at(&check_in_req("a", "1.0.0"), 10)
        .unwrap();
    assert_eq!(resp.update.unwrap().version, "2.0.0");
}

#[test]
fn channel_repoint_is_picked_up_by_next_check_in() {
    let fx = Fixture::new(capped(10));
    fx.catalog.update_channel_package("stable", Some("pkg-1"), 5).unwrap();
    assert_eq!(fx.check_in("a", "1.0.0", 10), CheckInStatus::NoUpdate);
    assert_eq!(
        fx.store.list_activity(1).unwrap()[0].kind,
        ActivityKind::ChannelPackageUpdated
    );
}

#[test]
fn hundred_racing_instances_never_exceed_cap() {
    let fx = Fixture::new(capped(10));
    let statuses = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for i in 0..100 {
            let handler = fx.handler.clone();
            let statuses = &statuses;
            s.spawn(move || {
                let resp = handler
                    .handle_check_in_at(&check_in_req(&format!("node-{i}"), "1.0.0"), 1000)
                    .unwrap();
                statuses.lock().unwrap().push(resp.status);
            });
        }
    });

    let statuses = statuses.into_inner().unwrap();
    assert_eq!(statuses.len(), 100);
    let granted = statuses.iter().filter(|s| **s == CheckInStatus::Update).count();
    let throttled = statuses.iter().filter(|s| **s == CheckInStatus::Throttled).count();
    assert_eq!(granted, 10);
    assert_eq!(throttled, 90);
    assert_eq!(fx.granted_this_period(1000), 10);

    let holding = fx
        .store
        .list_instances_for_application("coreos")
        .unwrap()
        .into_iter()
        .filter(|r| r.status == InstanceStatus::UpdateGranted)
        .count();
    assert_eq!(holding, 10);
}

#[test]
fn racing_check_ins_from_one_instance_take_one_slot() {
    let fx = Fixture::new(capped(10));
    let results = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for _ in 0..20 {
            let handler = fx.handler.clone();
            let results = &results;
            s.spawn(move || {
                let r = handler.handle_check_in_at(&check_in_req("twin", "1.0.0"), 1000);
                results.lock().unwrap().push(r);
            });
        }
    });

    for r in results.into_inner().unwrap() {
        match r {
            Ok(resp) => assert_eq!(resp.status, CheckInStatus::Update),
            Err(e) => assert!(matches!(e, HandlerError::Transient(_)), "unexpected error: {e}"),
        }
    }
    assert_eq!(fx.granted_this_period(1000), 1);
    let twin = fx.store.get_instance("coreos", "twin").unwrap().unwrap();
    assert_eq!(twin.status, InstanceStatus::UpdateGranted);
}
