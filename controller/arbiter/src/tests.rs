use crate::{Arbiter, ArbiterMetrics, LeaseLimits};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use patchbay_controller_core::{
    exporter::condition::ONLINE,
    get_condition,
    lease::condition::{EXPIRED, INVALID, PENDING, UNSATISFIABLE},
    set_condition, Condition, ConditionStatus, Exporter, Lease, LeaseSpec, ObjectMeta,
};
use patchbay_controller_store::Stores;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::time::Duration;

const OFFLINE_TIMEOUT: Duration = Duration::from_secs(180);
const OFFLINE_GRACE: Duration = Duration::from_secs(30);

fn arbiter(stores: &Stores) -> Arbiter {
    Arbiter::new(
        stores.clone(),
        LeaseLimits::default(),
        OFFLINE_TIMEOUT,
        OFFLINE_GRACE,
        false,
        ArbiterMetrics::default(),
    )
}

fn add_exporter(stores: &Stores, name: &str, labels: &[(&str, &str)], seen: DateTime<Utc>) {
    let created = stores
        .exporters()
        .create(Exporter {
            metadata: ObjectMeta::named("", name).with_labels(labels.iter().copied()),
            ..Default::default()
        })
        .unwrap();
    let mut online = created;
    online.status.last_seen = Some(seen);
    set_condition(
        &mut online.status.conditions,
        Condition::new(ONLINE, ConditionStatus::True, "Heartbeat", "", seen),
    );
    stores.exporters().update_status(online).unwrap();
}

fn add_lease(stores: &Stores, name: &str, selector: &str, duration: Option<Duration>) -> Lease {
    stores
        .leases()
        .create(Lease {
            metadata: ObjectMeta::named("", name),
            spec: LeaseSpec {
                selector: selector.parse().unwrap(),
                duration,
                client: "c1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
}

fn release(stores: &Stores, name: &str) {
    let mut lease = stores.leases().get(name).unwrap();
    lease.spec.release = true;
    stores.leases().update(lease).unwrap();
}

#[test]
fn pending_lease_binds_and_honors_the_duration_contract() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(60)));

    let arbiter = arbiter(&stores);
    let lease = arbiter.reconcile_lease("l1", t0).unwrap();

    assert!(lease.is_ready());
    assert_eq!(lease.status.exporter.as_deref(), Some("e1"));
    assert_eq!(lease.status.begin_time, Some(t0));
    assert_eq!(lease.status.end_time, Some(t0 + ChronoDuration::seconds(60)));
    assert_eq!(
        stores.exporters().get("e1").unwrap().status.lease_ref.as_deref(),
        Some("l1")
    );
}

#[test]
fn at_most_one_lease_is_ready_per_exporter() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(60)));
    add_lease(&stores, "l2", "board=mock", Some(Duration::from_secs(60)));

    let arbiter = arbiter(&stores);
    arbiter.reconcile_all(t0);

    let l1 = stores.leases().get("l1").unwrap();
    let l2 = stores.leases().get("l2").unwrap();
    assert!(l1.is_ready(), "older lease wins the exporter");
    assert!(l2.is_pending());
    assert_eq!(l2.status.exporter, None);

    // Releasing the winner hands the exporter to the waiter.
    release(&stores, "l1");
    let t1 = t0 + ChronoDuration::seconds(5);
    arbiter.reconcile_all(t1);

    let l1 = stores.leases().get("l1").unwrap();
    let l2 = stores.leases().get("l2").unwrap();
    assert!(l1.is_terminal());
    assert!(l2.is_ready());
    assert_eq!(l2.status.exporter.as_deref(), Some("e1"));
    assert_eq!(l2.status.end_time, Some(t1 + ChronoDuration::seconds(60)));
}

#[test]
fn newer_single_shot_reconcile_yields_to_an_older_pending_lease() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_lease(&stores, "old", "board=mock", Some(Duration::from_secs(60)));
    std::thread::sleep(Duration::from_millis(2));
    add_lease(&stores, "new", "board=mock", Some(Duration::from_secs(60)));
    add_exporter(&stores, "e1", &[("board", "mock")], t0);

    // Reconciling only the newer lease must not let it jump the queue.
    let arbiter = arbiter(&stores);
    let newer = arbiter.reconcile_lease("new", t0).unwrap();
    assert!(newer.is_pending());

    arbiter.reconcile_all(t0);
    assert!(stores.leases().get("old").unwrap().is_ready());
    assert!(stores.leases().get("new").unwrap().is_pending());
}

#[test]
fn leases_expire_at_end_time_and_free_the_exporter() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(60)));

    let arbiter = arbiter(&stores);
    arbiter.reconcile_all(t0);

    // Just before the end time nothing changes.
    let t1 = t0 + ChronoDuration::seconds(59);
    arbiter.reconcile_all(t1);
    assert!(stores.leases().get("l1").unwrap().is_ready());

    let t2 = t0 + ChronoDuration::seconds(60);
    arbiter.reconcile_all(t2);
    let lease = stores.leases().get("l1").unwrap();
    assert!(lease.is_terminal());
    assert!(get_condition(&lease.status.conditions, EXPIRED).unwrap().is_true());
    // The end time is the contractual one, not the sweep instant.
    assert_eq!(lease.status.end_time, Some(t0 + ChronoDuration::seconds(60)));
    assert_eq!(stores.exporters().get("e1").unwrap().status.lease_ref, None);
}

#[test]
fn release_is_idempotent_and_never_resurrects() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(600)));

    let arbiter = arbiter(&stores);
    arbiter.reconcile_all(t0);

    release(&stores, "l1");
    let t1 = t0 + ChronoDuration::seconds(10);
    arbiter.reconcile_all(t1);
    let terminal = stores.leases().get("l1").unwrap();
    assert!(terminal.is_terminal());
    // Early release pulls the end time forward to the release instant.
    assert_eq!(terminal.status.end_time, Some(t1));

    // Releasing again, and reconciling at later instants, changes nothing.
    release(&stores, "l1");
    arbiter.reconcile_all(t1 + ChronoDuration::seconds(100));
    let still = stores.leases().get("l1").unwrap();
    assert_eq!(still.status, terminal.status);
}

#[test]
fn release_before_binding_terminates_a_pending_lease() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(60)));
    release(&stores, "l1");

    let arbiter = arbiter(&stores);
    let lease = arbiter.reconcile_lease("l1", t0).unwrap();
    assert!(lease.is_terminal());
    assert_eq!(lease.status.begin_time, None);
    assert_eq!(lease.status.end_time, Some(t0));
}

#[test]
fn heartbeat_timeout_takes_the_exporter_offline_and_evicts_its_lease() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(3600)));

    let arbiter = arbiter(&stores);
    arbiter.reconcile_all(t0);
    assert!(stores.leases().get("l1").unwrap().is_ready());

    // Heartbeats stop; at the offline timeout the exporter goes offline but
    // the lease survives the grace window.
    let t1 = t0 + ChronoDuration::seconds(180);
    arbiter.reconcile_all(t1);
    let exporter = stores.exporters().get("e1").unwrap();
    assert!(!exporter.is_online());
    assert!(stores.leases().get("l1").unwrap().is_ready());

    // Grace expires: the lease is evicted, but not marked time-expired.
    let t2 = t1 + ChronoDuration::seconds(30);
    arbiter.reconcile_all(t2);
    let lease = stores.leases().get("l1").unwrap();
    assert!(lease.is_terminal());
    assert!(get_condition(&lease.status.conditions, EXPIRED).is_none());

    // New leases for the board stay pending while nothing is online.
    add_lease(&stores, "l2", "board=mock", Some(Duration::from_secs(60)));
    arbiter.reconcile_all(t2);
    let l2 = stores.leases().get("l2").unwrap();
    assert!(l2.is_pending());
    assert!(!get_condition(&l2.status.conditions, UNSATISFIABLE).is_some_and(|c| c.is_true()));
}

#[test]
fn deleting_the_bound_exporter_terminates_the_lease() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(3600)));

    let arbiter = arbiter(&stores);
    arbiter.reconcile_all(t0);

    stores.exporters().delete("e1", None).unwrap();
    let lease = arbiter
        .reconcile_lease("l1", t0 + ChronoDuration::seconds(1))
        .unwrap();
    assert!(lease.is_terminal());
}

#[test]
fn unmatched_selector_is_unsatisfiable_until_an_exporter_appears() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(60)));

    let arbiter = arbiter(&stores);
    let lease = arbiter.reconcile_lease("l1", t0).unwrap();
    assert!(get_condition(&lease.status.conditions, UNSATISFIABLE).unwrap().is_true());
    assert!(!lease.is_pending());

    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    arbiter.reconcile_all(t0);
    assert!(stores.leases().get("l1").unwrap().is_ready());
}

#[rstest]
#[case::zero_duration_unmatched(Some(Duration::ZERO), "ZeroDurationUnsatisfied")]
#[case::unlimited_not_allowed(None, "UnlimitedNotAllowed")]
fn invalid_requests_are_marked_invalid(
    #[case] duration: Option<Duration>,
    #[case] reason: &str,
) {
    let stores = Stores::new("default");
    let arbiter = arbiter(&stores);
    add_lease(&stores, "l1", "board=mock", duration);

    let lease = arbiter.reconcile_lease("l1", Utc::now()).unwrap();
    assert!(get_condition(&lease.status.conditions, INVALID).unwrap().is_true());
    assert_eq!(lease.reason(), reason);
}

#[test]
fn unlimited_leases_bind_without_an_end_time_when_permitted() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    let permissive = Arbiter::new(
        stores.clone(),
        LeaseLimits {
            allow_unlimited: true,
            ..Default::default()
        },
        OFFLINE_TIMEOUT,
        OFFLINE_GRACE,
        false,
        ArbiterMetrics::default(),
    );
    add_lease(&stores, "l2", "board=mock", None);
    let lease = permissive.reconcile_lease("l2", t0).unwrap();
    assert!(lease.is_ready());
    assert_eq!(lease.status.end_time, None);
}

#[test]
fn explicit_binding_to_an_unknown_exporter_is_invalid_without_provisioning() {
    let stores = Stores::new("default");
    stores
        .leases()
        .create(Lease {
            metadata: ObjectMeta::named("", "l1"),
            spec: LeaseSpec {
                exporter: Some("ghost".to_string()),
                duration: Some(Duration::from_secs(60)),
                client: "c1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

    let lease = arbiter(&stores).reconcile_lease("l1", Utc::now()).unwrap();
    assert!(lease.is_invalid());
    assert_eq!(lease.reason(), "UnknownExporter");
}

#[test]
fn extending_the_spec_duration_advances_the_end_time() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(60)));

    let arbiter = arbiter(&stores);
    arbiter.reconcile_all(t0);

    let mut lease = stores.leases().get("l1").unwrap();
    lease.spec.duration = Some(Duration::from_secs(120));
    stores.leases().update(lease).unwrap();
    arbiter.reconcile_all(t0 + ChronoDuration::seconds(10));
    assert_eq!(
        stores.leases().get("l1").unwrap().status.end_time,
        Some(t0 + ChronoDuration::seconds(120))
    );

    // Shrinking the requested duration never rolls the end time back.
    let mut lease = stores.leases().get("l1").unwrap();
    lease.spec.duration = Some(Duration::from_secs(30));
    stores.leases().update(lease).unwrap();
    arbiter.reconcile_all(t0 + ChronoDuration::seconds(20));
    assert_eq!(
        stores.leases().get("l1").unwrap().status.end_time,
        Some(t0 + ChronoDuration::seconds(120))
    );
}

#[test]
fn terminal_leases_are_left_untouched_by_further_sweeps() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(1)));

    let arbiter = arbiter(&stores);
    arbiter.reconcile_all(t0);
    arbiter.reconcile_all(t0 + ChronoDuration::seconds(2));
    let terminal = stores.leases().get("l1").unwrap();
    assert!(terminal.is_terminal());

    let rev = terminal.metadata.resource_version;
    arbiter.reconcile_all(t0 + ChronoDuration::seconds(500));
    assert_eq!(
        stores.leases().get("l1").unwrap().metadata.resource_version,
        rev
    );
}

#[test]
fn next_wakeup_tracks_the_earliest_end_time() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_exporter(&stores, "e2", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(300)));
    add_lease(&stores, "l2", "board=mock", Some(Duration::from_secs(60)));

    let deadline = arbiter(&stores).reconcile_all(t0).unwrap();
    // The earliest attention point is l2's end time (the exporters'
    // heartbeat deadline is t0+180s, later than t0+60s).
    assert_eq!(deadline, t0 + ChronoDuration::seconds(60));
}

#[test]
fn pending_reason_is_reported() {
    let stores = Stores::new("default");
    let t0 = Utc::now();
    add_exporter(&stores, "e1", &[("board", "mock")], t0);
    add_lease(&stores, "l1", "board=mock", Some(Duration::from_secs(600)));
    add_lease(&stores, "l2", "board=mock", Some(Duration::from_secs(600)));

    arbiter(&stores).reconcile_all(t0);
    let l2 = stores.leases().get("l2").unwrap();
    assert_eq!(
        get_condition(&l2.status.conditions, PENDING).unwrap().reason,
        "NoAvailableExporter"
    );
}
