//! Unit tests for the resource cache

use super::*;
use crate::test_utils::*;
use k8s_openapi::api::core::v1::ConfigMap;

fn new_feeder() -> (CacheFeeder<ConfigMap>, mpsc::Receiver<Notification<ConfigMap>>) {
    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    (CacheFeeder::new("ConfigMap", tx), rx)
}

fn initial_list(feeder: &mut CacheFeeder<ConfigMap>, objects: &[ConfigMap]) -> Vec<Notification<ConfigMap>> {
    let mut out = feeder.apply(&watcher::Event::Init);
    for obj in objects {
        out.extend(feeder.apply(&watcher::Event::InitApply(obj.clone())));
    }
    out.extend(feeder.apply(&watcher::Event::InitDone));
    out
}

fn names(notifications: &[Notification<ConfigMap>]) -> Vec<(&'static str, String)> {
    let mut out: Vec<_> = notifications
        .iter()
        .map(|n| match n {
            Notification::Added(obj) => ("added", obj.metadata.name.clone().unwrap_or_default()),
            Notification::Updated { new, .. } => ("updated", new.metadata.name.clone().unwrap_or_default()),
            Notification::Deleted(obj) => ("deleted", obj.metadata.name.clone().unwrap_or_default()),
        })
        .collect();
    out.sort();
    out
}

#[test]
fn test_initial_list_marks_synced_and_adds_everything() {
    let (mut feeder, _rx) = new_feeder();
    let cache = feeder.cache();
    assert!(!cache.has_synced());

    let out = initial_list(
        &mut feeder,
        &[
            create_test_config_map("a", "default", None),
            create_test_config_map("b", "other", None),
        ],
    );

    assert!(cache.has_synced());
    assert_eq!(names(&out), vec![("added", "a".to_string()), ("added", "b".to_string())]);
    assert!(cache.get("default", "a").is_some());
    assert!(cache.get("other", "a").is_none());
    assert_eq!(cache.list("other").len(), 1);
    assert_eq!(cache.list("").len(), 2);
}

#[test]
fn test_apply_reports_add_then_update_with_previous_snapshot() {
    let (mut feeder, _rx) = new_feeder();
    let cache = feeder.cache();
    initial_list(&mut feeder, &[]);

    let mut cm = create_test_config_map("a", "default", None);
    let out = feeder.apply(&watcher::Event::Apply(cm.clone()));
    assert!(matches!(out.as_slice(), [Notification::Added(_)]));

    cm.metadata.resource_version = Some("2".to_string());
    let out = feeder.apply(&watcher::Event::Apply(cm));
    match out.as_slice() {
        [Notification::Updated { old, new }] => {
            assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
            assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
        }
        other => panic!("expected a single update, got {other:?}"),
    }
    assert_eq!(
        cache.get("default", "a").and_then(|cm| cm.metadata.resource_version.clone()),
        Some("2".to_string())
    );
}

#[test]
fn test_delete_removes_from_cache() {
    let (mut feeder, _rx) = new_feeder();
    let cache = feeder.cache();
    let cm = create_test_config_map("a", "default", None);
    initial_list(&mut feeder, &[cm.clone()]);

    let out = feeder.apply(&watcher::Event::Delete(cm));

    assert_eq!(names(&out), vec![("deleted", "a".to_string())]);
    assert!(cache.get("default", "a").is_none());
}

#[test]
fn test_relist_reports_vanished_objects_as_deleted() {
    let (mut feeder, _rx) = new_feeder();
    let cache = feeder.cache();
    initial_list(
        &mut feeder,
        &[
            create_test_config_map("kept", "default", None),
            create_test_config_map("gone", "default", None),
        ],
    );

    // Reconnect: the new listing no longer contains "gone" but has "new"
    let out = initial_list(
        &mut feeder,
        &[
            create_test_config_map("kept", "default", None),
            create_test_config_map("new", "default", None),
        ],
    );

    assert_eq!(
        names(&out),
        vec![
            ("added", "new".to_string()),
            ("deleted", "gone".to_string()),
            ("updated", "kept".to_string()),
        ]
    );
    assert!(cache.get("default", "gone").is_none());
    assert!(cache.has_synced());
}

#[test]
fn test_resync_redelivers_identical_snapshots() {
    let (mut feeder, _rx) = new_feeder();
    initial_list(&mut feeder, &[create_test_config_map("a", "default", None)]);

    let out = feeder.resync();

    match out.as_slice() {
        [Notification::Updated { old, new }] => assert!(Arc::ptr_eq(old, new)),
        other => panic!("expected a single update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_forwards_notifications_and_unblocks_sync_barrier() {
    let (feeder, mut rx) = new_feeder();
    let cache = feeder.cache();
    let events = futures::stream::iter(vec![
        Ok(watcher::Event::Init),
        Ok(watcher::Event::InitApply(create_test_config_map("a", "default", None))),
        Ok(watcher::Event::InitDone),
    ]);

    let result = feeder.run(events, None).await;

    assert!(matches!(result, Err(ControllerError::Watch(_))), "ended stream is reported");
    cache.wait_for_sync().await.expect("cache should be ready");
    assert!(matches!(rx.recv().await, Some(Notification::Added(_))));
}

#[tokio::test]
async fn test_wait_for_sync_fails_when_feeder_is_dropped() {
    let (feeder, _rx) = new_feeder();
    let cache = feeder.cache();
    drop(feeder);

    assert!(matches!(cache.wait_for_sync().await, Err(ControllerError::CacheClosed("ConfigMap"))));
    assert!(!cache.has_synced());
}

#[tokio::test(start_paused = true)]
async fn test_run_resyncs_periodically_after_sync() {
    let (feeder, mut rx) = new_feeder();
    let events = futures::stream::iter(vec![
        Ok(watcher::Event::Init),
        Ok(watcher::Event::InitApply(create_test_config_map("a", "default", None))),
        Ok(watcher::Event::InitDone),
    ])
    .chain(futures::stream::pending());

    let task = tokio::spawn(feeder.run(events, Some(Duration::from_secs(30))));

    assert!(matches!(rx.recv().await, Some(Notification::Added(_))));
    match rx.recv().await {
        Some(Notification::Updated { old, new }) => assert!(Arc::ptr_eq(&old, &new)),
        other => panic!("expected a resync update, got {other:?}"),
    }

    drop(rx);
    task.abort();
}

#[tokio::test]
async fn test_synced_cache_stays_ready_after_feeder_is_dropped() {
    let (mut feeder, _rx) = new_feeder();
    let cache = feeder.cache();
    initial_list(&mut feeder, &[create_test_config_map("a", "default", None)]);
    drop(feeder);

    cache.wait_for_sync().await.expect("synced cache is ready");
    assert!(cache.has_synced());
    assert_eq!(format!("{cache:?}"), "ResourceCache { kind: \"ConfigMap\", synced: true, .. }");
}
