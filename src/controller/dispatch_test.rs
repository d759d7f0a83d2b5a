#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::controller::cluster::MockCluster;
use serde_json::json;

const V1: &str = "myapp-v1-default";
const V2: &str = "myapp-v2-default";
const V3: &str = "myapp-v3-default";

fn config_map(name: &str, value: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": "default",
            "ownerReferences": [{
                "apiVersion": "core.oam.dev/v1beta1",
                "kind": "Application",
                "name": "myapp",
                "uid": "app-uid",
                "controller": true,
                "blockOwnerDeletion": true
            }]
        },
        "data": {"value": value}
    }))
    .unwrap()
}

fn set(names: &[&str]) -> Vec<DynamicObject> {
    names.iter().map(|n| config_map(n, "v")).collect()
}

fn id(name: &str) -> TrackedResource {
    TrackedResource {
        api_version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        namespace: Some("default".to_string()),
        name: name.to_string(),
    }
}

fn tracked_names(cluster: &MockCluster, tracker: &str) -> Vec<String> {
    let mut names: Vec<_> = cluster
        .tracker(tracker)
        .expect("tracker exists")
        .tracked()
        .iter()
        .map(|r| r.name.clone())
        .collect();
    names.sort();
    names
}

fn tracker_owners(obj: &DynamicObject) -> Vec<String> {
    obj.owner_references()
        .iter()
        .filter(|o| is_tracker_owner(o))
        .map(|o| o.name.clone())
        .collect()
}

fn dispatcher(cluster: &Arc<MockCluster>, tracker: &str) -> Dispatcher {
    Dispatcher::with_tracker(cluster.clone(), tracker.to_string())
}

#[tokio::test]
async fn test_dispatch_creates_resources_and_tracker() {
    let cluster = Arc::new(MockCluster::new());

    let applied = dispatcher(&cluster, V1).dispatch(&set(&["a", "b"])).await.unwrap();

    assert_eq!(applied, vec![id("a"), id("b")]);
    assert_eq!(tracked_names(&cluster, V1), vec!["a", "b"]);

    let a = cluster.object(&id("a")).unwrap();
    assert_eq!(tracker_owners(&a), vec![V1.to_string()]);
    // Application controller owner is kept next to the tracker owner
    assert!(a.owner_references().iter().any(|o| o.kind == "Application" && o.controller == Some(true)));
    let tracker_ref = a.owner_references().iter().find(|o| is_tracker_owner(o)).unwrap();
    assert_eq!(tracker_ref.controller, Some(false));
    assert_eq!(tracker_ref.block_owner_deletion, Some(true));
    assert_eq!(tracker_ref.uid, format!("uid-rt-{}", V1));
}

#[tokio::test]
async fn test_dispatch_is_idempotent() {
    let cluster = Arc::new(MockCluster::new());
    let manifests = set(&["a", "b"]);

    dispatcher(&cluster, V1).dispatch(&manifests).await.unwrap();
    cluster.clear_log();
    dispatcher(&cluster, V1).dispatch(&manifests).await.unwrap();

    assert!(cluster.log().is_empty(), "unexpected writes: {:?}", cluster.log());
}

#[tokio::test]
async fn test_dispatch_replaces_changed_resources() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a"])).await.unwrap();
    cluster.clear_log();

    dispatcher(&cluster, V1)
        .dispatch(&[config_map("a", "changed")])
        .await
        .unwrap();

    assert_eq!(cluster.log(), vec!["replace ConfigMap/a"]);
    assert_eq!(cluster.object(&id("a")).unwrap().data["data"]["value"], "changed");
}

#[tokio::test]
async fn test_gc_removes_resources_missing_from_new_set() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a", "b", "c"])).await.unwrap();

    dispatcher(&cluster, V2)
        .enable_gc(V1)
        .dispatch(&set(&["b", "c", "d"]))
        .await
        .unwrap();

    assert!(cluster.object(&id("a")).is_none());
    for name in ["b", "c", "d"] {
        let obj = cluster.object(&id(name)).unwrap();
        assert_eq!(tracker_owners(&obj), vec![V2.to_string()], "owner of {}", name);
    }
    assert_eq!(tracked_names(&cluster, V2), vec!["b", "c", "d"]);
    assert!(cluster.tracker(V1).is_none(), "empty prior tracker is deleted");
}

#[tokio::test]
async fn test_gc_dispatch_is_idempotent() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a", "b", "c"])).await.unwrap();
    let gc = || dispatcher(&cluster, V2).enable_gc(V1);

    gc().dispatch(&set(&["b", "c", "d"])).await.unwrap();
    let objects = cluster.objects();
    cluster.clear_log();
    gc().dispatch(&set(&["b", "c", "d"])).await.unwrap();

    assert_eq!(cluster.objects(), objects);
    assert!(cluster.log().is_empty(), "unexpected writes: {:?}", cluster.log());
}

#[tokio::test]
async fn test_adopt_moves_ledger_without_deleting() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a", "b"])).await.unwrap();

    dispatcher(&cluster, V2)
        .enable_upgrade_and_skip_gc(V1)
        .dispatch(&set(&["a", "b"]))
        .await
        .unwrap();

    assert_eq!(tracked_names(&cluster, V2), vec!["a", "b"]);
    assert!(tracked_names(&cluster, V1).is_empty());
    for name in ["a", "b"] {
        let obj = cluster.object(&id(name)).unwrap();
        assert_eq!(tracker_owners(&obj), vec![V2.to_string()]);
    }
    assert!(!cluster.log().iter().any(|op| op.starts_with("delete")));
}

#[tokio::test]
async fn test_adopt_keeps_unrelated_source_entries() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a", "b"])).await.unwrap();

    dispatcher(&cluster, V2)
        .enable_upgrade_and_skip_gc(V1)
        .dispatch(&set(&["a"]))
        .await
        .unwrap();

    assert_eq!(tracked_names(&cluster, V1), vec!["b"]);
    assert!(cluster.object(&id("b")).is_some());
}

#[tokio::test]
async fn test_gc_skips_resources_owned_by_another_tracker() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a", "b"])).await.unwrap();
    // A third revision took over `a` without cleaning the v1 ledger
    dispatcher(&cluster, V3).dispatch(&set(&["a"])).await.unwrap();

    dispatcher(&cluster, V2).enable_gc(V1).dispatch(&set(&[])).await.unwrap();

    assert!(cluster.object(&id("a")).is_some());
    assert!(cluster.object(&id("b")).is_none());
    assert!(cluster.tracker(V1).is_none());
}

#[tokio::test]
async fn test_prune_in_place_keeps_tracker() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a", "b", "c"])).await.unwrap();

    dispatcher(&cluster, V1)
        .enable_gc(V1)
        .dispatch(&set(&["a", "b"]))
        .await
        .unwrap();

    assert!(cluster.object(&id("c")).is_none());
    assert_eq!(tracked_names(&cluster, V1), vec!["a", "b"]);
}

#[tokio::test]
async fn test_gc_without_prior_tracker() {
    let cluster = Arc::new(MockCluster::new());

    let applied = dispatcher(&cluster, V2)
        .enable_gc(V1)
        .dispatch(&set(&["a"]))
        .await
        .unwrap();

    assert_eq!(applied, vec![id("a")]);
}

#[tokio::test]
async fn test_replace_keeps_live_finalizers_and_foreign_owners() {
    let cluster = Arc::new(MockCluster::new());
    let mut live = config_map("a", "old");
    live.metadata.finalizers = Some(vec!["example.com/protect".to_string()]);
    live.owner_references_mut().push(OwnerReference {
        api_version: "example.com/v1".to_string(),
        kind: "Backup".to_string(),
        name: "nightly".to_string(),
        uid: "backup-uid".to_string(),
        controller: None,
        block_owner_deletion: None,
    });
    cluster.add_object(live);

    dispatcher(&cluster, V1).dispatch(&[config_map("a", "new")]).await.unwrap();

    let a = cluster.object(&id("a")).unwrap();
    assert_eq!(a.data["data"]["value"], "new");
    assert_eq!(a.finalizers(), &["example.com/protect".to_string()]);
    let kinds: Vec<_> = a.owner_references().iter().map(|o| o.kind.as_str()).collect();
    assert_eq!(kinds, vec!["Application", "ResourceTracker", "Backup"]);
}

#[tokio::test]
async fn test_conflicts_are_retried() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a"])).await.unwrap();
    cluster.inject_conflicts(id("a"), 2);

    dispatcher(&cluster, V1)
        .dispatch(&[config_map("a", "retried")])
        .await
        .unwrap();

    assert_eq!(cluster.object(&id("a")).unwrap().data["data"]["value"], "retried");
}

#[tokio::test]
async fn test_conflict_retries_are_bounded() {
    let cluster = Arc::new(MockCluster::new());
    dispatcher(&cluster, V1).dispatch(&set(&["a"])).await.unwrap();
    cluster.inject_conflicts(id("a"), DEFAULT_CONFLICT_RETRIES);

    let err = dispatcher(&cluster, V1)
        .dispatch(&[config_map("a", "never")])
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::ConflictRetriesExhausted(_, 5)), "{}", err);
}

#[tokio::test]
async fn test_partial_progress_is_recorded_on_error() {
    let cluster = Arc::new(MockCluster::new());
    cluster.inject_create_failures(id("c"), 1);

    let err = dispatcher(&cluster, V1)
        .dispatch(&set(&["a", "b", "c"]))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Apply { ref resource, .. } if resource.name == "c"));
    assert_eq!(tracked_names(&cluster, V1), vec!["a", "b"]);
}

#[tokio::test]
async fn test_dispatcher_for_revision_uses_tracker_name() {
    let cluster = Arc::new(MockCluster::new());
    let mut revision = ApplicationRevision::new("myapp-v1", Default::default());
    revision.metadata.namespace = Some("default".to_string());

    let d = Dispatcher::new(cluster.clone(), &revision);

    assert_eq!(d.tracker_name(), V1);
}
