use crate::{Error, Event, Store};
use patchbay_controller_core::{
    exporter::condition::ONLINE, Condition, ConditionStatus, Exporter, ObjectMeta, Selector,
};
use pretty_assertions::assert_eq;

fn exporter(name: &str, labels: &[(&str, &str)]) -> Exporter {
    Exporter {
        metadata: ObjectMeta::named("", name).with_labels(labels.iter().copied()),
        ..Default::default()
    }
}

fn selector(s: &str) -> Selector {
    s.parse().unwrap()
}

#[test]
fn create_assigns_metadata_and_rejects_duplicates() {
    let store = Store::<Exporter>::new("default");

    let created = store.create(exporter("e1", &[])).unwrap();
    assert_eq!(created.metadata.namespace, "default");
    assert_eq!(created.metadata.resource_version, 1);
    assert_eq!(created.metadata.generation, 1);
    assert!(!created.metadata.uid.is_empty());
    assert!(created.metadata.creation_timestamp.is_some());

    assert_eq!(
        store.create(exporter("e1", &[])),
        Err(Error::AlreadyExists {
            kind: patchbay_controller_core::Kind::Exporter,
            name: "e1".to_string()
        })
    );
}

#[test]
fn create_rejects_foreign_namespace() {
    let store = Store::<Exporter>::new("default");
    let mut obj = exporter("e1", &[]);
    obj.metadata.namespace = "other".to_string();
    assert!(matches!(store.create(obj), Err(Error::Invalid { .. })));
}

#[test]
fn stale_spec_write_conflicts() {
    let store = Store::<Exporter>::new("default");
    let created = store.create(exporter("e1", &[])).unwrap();

    let mut first = created.clone();
    first.metadata.labels.insert("a".to_string(), "1".to_string());
    store.update(first).unwrap();

    // A second writer still holding the original revision loses.
    let mut second = created;
    second.metadata.labels.insert("a".to_string(), "2".to_string());
    assert!(store.update(second).unwrap_err().is_conflict());
}

#[test]
fn status_and_spec_writes_do_not_cross_conflict() {
    let store = Store::<Exporter>::new("default");
    let created = store.create(exporter("e1", &[])).unwrap();

    // Spec write from another actor.
    let mut spec_write = created.clone();
    spec_write
        .metadata
        .labels
        .insert("board".to_string(), "mock".to_string());
    let after_spec = store.update(spec_write).unwrap();
    assert_eq!(after_spec.metadata.generation, 2);

    // A status writer that read the object before the spec write still
    // succeeds, and does not clobber the new spec.
    let mut status_write = created.clone();
    status_write.status.last_seen = Some(chrono::Utc::now());
    let after_status = store.update_status(status_write).unwrap();
    assert_eq!(after_status.metadata.labels.get("board").unwrap(), "mock");
    assert!(after_status.status.last_seen.is_some());
    // Status writes never bump the generation.
    assert_eq!(after_status.metadata.generation, 2);

    // And symmetrically: a spec writer holding the pre-status revision
    // succeeds without clobbering status.
    let mut spec_write = after_spec;
    spec_write
        .metadata
        .labels
        .insert("rack".to_string(), "r1".to_string());
    let after = store.update(spec_write).unwrap();
    assert!(after.status.last_seen.is_some());

    // But two status writers from the same snapshot conflict.
    let mut racing = created.clone();
    racing.status.conditions.push(Condition::new(
        ONLINE,
        ConditionStatus::True,
        "Heartbeat",
        "",
        chrono::Utc::now(),
    ));
    assert!(store.update_status(racing).unwrap_err().is_conflict());
}

#[test]
fn noop_writes_do_not_bump_revision() {
    let store = Store::<Exporter>::new("default");
    let created = store.create(exporter("e1", &[("a", "1")])).unwrap();
    let rev = store.revision();
    store.update(created.clone()).unwrap();
    store.update_status(created).unwrap();
    assert_eq!(store.revision(), rev);
}

#[test]
fn delete_honors_preconditions() {
    let store = Store::<Exporter>::new("default");
    let created = store.create(exporter("e1", &[])).unwrap();

    assert!(store.delete("e1", Some(999)).unwrap_err().is_conflict());
    store
        .delete("e1", Some(created.metadata.resource_version))
        .unwrap();
    assert!(store.delete("e1", None).unwrap_err().is_not_found());
}

#[test]
fn list_filters_by_selector() {
    let store = Store::<Exporter>::new("default");
    store.create(exporter("e1", &[("board", "mock")])).unwrap();
    store.create(exporter("e2", &[("board", "real")])).unwrap();
    store.create(exporter("e3", &[("board", "mock")])).unwrap();

    let names = |sel: &str| {
        store
            .list(&selector(sel))
            .into_iter()
            .map(|e| e.metadata.name)
            .collect::<Vec<_>>()
    };
    assert_eq!(names("board=mock"), vec!["e1", "e3"]);
    assert_eq!(names(""), vec!["e1", "e2", "e3"]);
    assert_eq!(names("board=none"), Vec::<String>::new());
}

#[tokio::test]
async fn watch_observes_every_transition_exactly_once() {
    let store = Store::<Exporter>::new("default");
    let mut watcher = store.watch(Selector::default(), None).unwrap();

    let created = store.create(exporter("e1", &[])).unwrap();
    let mut modified = created.clone();
    modified
        .metadata
        .labels
        .insert("board".to_string(), "mock".to_string());
    let modified = store.update(modified).unwrap();
    store.delete("e1", None).unwrap();

    match watcher.next().await.unwrap() {
        Event::Added(obj) => assert_eq!(obj, created),
        other => panic!("expected Added, got {other:?}"),
    }
    match watcher.next().await.unwrap() {
        Event::Modified(obj) => assert_eq!(obj, modified),
        other => panic!("expected Modified, got {other:?}"),
    }
    match watcher.next().await.unwrap() {
        Event::Deleted(obj) => assert_eq!(obj.metadata.name, "e1"),
        other => panic!("expected Deleted, got {other:?}"),
    }
}

#[tokio::test]
async fn watch_resumes_from_observed_revision() {
    let store = Store::<Exporter>::new("default");
    store.create(exporter("e1", &[])).unwrap();
    let rev = store.revision();
    store.create(exporter("e2", &[])).unwrap();

    let mut watcher = store.watch(Selector::default(), Some(rev)).unwrap();
    match watcher.next().await.unwrap() {
        Event::Added(obj) => assert_eq!(obj.metadata.name, "e2"),
        other => panic!("expected Added, got {other:?}"),
    }
}

#[tokio::test]
async fn watch_filters_by_selector() {
    let store = Store::<Exporter>::new("default");
    let mut watcher = store.watch(selector("board=mock"), None).unwrap();

    store.create(exporter("skip", &[("board", "real")])).unwrap();
    store.create(exporter("take", &[("board", "mock")])).unwrap();

    match watcher.next().await.unwrap() {
        Event::Added(obj) => assert_eq!(obj.metadata.name, "take"),
        other => panic!("expected Added, got {other:?}"),
    }
}

#[test]
fn watch_from_before_the_window_fails_loudly() {
    let store = Store::<Exporter>::with_window("default", 2);
    for i in 0..5 {
        store.create(exporter(&format!("e{i}"), &[])).unwrap();
    }

    // Revisions 1..=3 have been evicted; only 4 and 5 remain.
    assert!(matches!(
        store.watch(Selector::default(), Some(1)),
        Err(Error::WindowExpired { oldest: 4, .. })
    ));
    assert!(store.watch(Selector::default(), Some(3)).is_ok());
}

#[tokio::test]
async fn slow_watcher_fails_rather_than_skipping() {
    let store = Store::<Exporter>::with_window("default", 2);
    let mut watcher = store.watch(Selector::default(), None).unwrap();

    for i in 0..5 {
        store.create(exporter(&format!("e{i}"), &[])).unwrap();
    }

    assert!(matches!(
        watcher.next().await,
        Err(Error::WindowExpired { .. })
    ));
}

#[tokio::test]
async fn list_and_watch_has_no_gap() {
    let store = Store::<Exporter>::new("default");
    store.create(exporter("e1", &[])).unwrap();

    let (objs, mut watcher) = store.list_and_watch(Selector::default());
    assert_eq!(objs.len(), 1);

    store.create(exporter("e2", &[])).unwrap();
    match watcher.next().await.unwrap() {
        Event::Added(obj) => assert_eq!(obj.metadata.name, "e2"),
        other => panic!("expected Added, got {other:?}"),
    }
}
