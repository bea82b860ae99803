#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kview_api::{pair, Backend, BridgeClient, BridgeConfig, StaticConnector};
use kview_core::{ChangeType, KviewError, ResourceKind};
use kview_kubehub::mock::{object, MockClient};
use kview_kubehub::{RawEvent, RetryPolicy, WatchConfig, WatchError};
use kview_store::{ClusterView, Snapshot, StoreHandle};
use tokio::task::JoinHandle;

fn config() -> BridgeConfig {
    BridgeConfig {
        queue_cap: 64,
        request_timeout: Duration::from_secs(2),
        watch: WatchConfig { retry: RetryPolicy::Fixed(Duration::from_millis(20)), stop_timeout: Duration::from_secs(1) },
    }
}

fn start(mock: &Arc<MockClient>) -> (BridgeClient, JoinHandle<()>) { start_with(mock, config()) }

fn start_with(mock: &Arc<MockClient>, cfg: BridgeConfig) -> (BridgeClient, JoinHandle<()>) {
    let (client, endpoint) = pair(&cfg);
    let backend = Backend::new(Arc::new(StaticConnector::new(mock.clone())), cfg);
    (client, backend.spawn(endpoint))
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_store(store: &StoreHandle, what: &str, cond: impl Fn(&Snapshot) -> bool) {
    let mut epochs = store.subscribe_epoch();
    while !cond(&*store.current()) {
        let changed = tokio::time::timeout(Duration::from_secs(2), epochs.changed()).await;
        assert!(matches!(changed, Ok(Ok(()))), "timed out waiting for {}", what);
    }
}

fn names(store: &StoreHandle) -> Vec<String> { store.current().list().iter().map(|o| o.display_name()).collect() }

#[tokio::test]
async fn register_before_initialize_fails_fast() {
    let mock = Arc::new(MockClient::new());
    let (client, _backend) = start(&mock);
    let res = client.register_watcher(ResourceKind::Pod, Some("default")).await;
    assert!(matches!(res, Err(KviewError::NotInitialized(_))), "got {:?}", res);
    let res = client.list_namespaces().await;
    assert!(matches!(res, Err(KviewError::NotInitialized(_))));
    assert_eq!(mock.opened(), 0);
}

#[tokio::test]
async fn failed_initialize_is_false_not_an_error() {
    let cfg = config();
    let (client, endpoint) = pair(&cfg);
    Backend::new(Arc::new(StaticConnector::failing()), cfg).spawn(endpoint);
    assert!(!client.initialize().await);
    assert!(matches!(
        client.register_watcher(ResourceKind::Pod, Some("default")).await,
        Err(KviewError::NotInitialized(_))
    ));
}

#[tokio::test]
async fn watch_events_round_trip_as_signals() {
    let mock = Arc::new(MockClient::new());
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);

    let mut pods = client.on_object_changed(ResourceKind::Pod);
    let mut deployments = client.on_object_changed(ResourceKind::Deployment);
    let mut connected = client.on_connected();
    client.register_watcher(ResourceKind::Pod, Some("default")).await.unwrap();
    wait_for("pod watch to open", || mock.opened() == 1).await;
    assert_eq!(mock.feed_namespace(0), Some(Some("default".to_string())));

    let feed = mock.feed(0).unwrap();
    feed.send(Ok(RawEvent::Restarted(vec![object("p1", Some("default"), "nginx")]))).unwrap();
    let ev = pods.recv().await.unwrap();
    assert_eq!(ev.change_type, ChangeType::Added);
    assert_eq!(ev.object.uid, "p1");
    assert_eq!(connected.recv().await, Some(ResourceKind::Pod));

    feed.send(Ok(RawEvent::Deleted(object("p1", Some("default"), "nginx")))).unwrap();
    assert_eq!(pods.recv().await.unwrap().change_type, ChangeType::Deleted);
    // nothing was routed to the other kind
    assert!(deployments.try_recv().is_err());
}

#[tokio::test]
async fn stream_errors_reach_the_error_signal() {
    let mock = Arc::new(MockClient::new());
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);
    let mut errors = client.on_error();
    client.register_watcher(ResourceKind::Deployment, Some("default")).await.unwrap();
    wait_for("deployment watch to open", || mock.opened() == 1).await;

    mock.feed(0).unwrap().send(Err(WatchError::Transport("connection refused".into()))).unwrap();
    let notice = errors.recv().await.unwrap();
    assert_eq!(notice.kind, Some(ResourceKind::Deployment));
    assert!(notice.message.contains("connection refused"), "{}", notice.message);
}

#[tokio::test]
async fn reselecting_namespace_replaces_the_watcher() {
    let mock = Arc::new(MockClient::new());
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);
    let store = client.watch_store(ResourceKind::Pod);

    client.register_watcher(ResourceKind::Pod, Some("default")).await.unwrap();
    client.register_watcher(ResourceKind::Pod, Some("kube-system")).await.unwrap();
    wait_for("both watches to open", || mock.opened() == 2).await;
    wait_for("old watch to be torn down", || mock.dropped() == 1).await;
    assert_eq!(mock.feed_namespace(1), Some(Some("kube-system".to_string())));

    mock.feed(1)
        .unwrap()
        .send(Ok(RawEvent::Restarted(vec![object("k1", Some("kube-system"), "coredns")])))
        .unwrap();
    let mut epochs = store.subscribe_epoch();
    while store.current().get("k1").is_none() {
        tokio::time::timeout(Duration::from_secs(2), epochs.changed()).await.unwrap().unwrap();
    }
    let watched = client.list_watched(ResourceKind::Pod).await.unwrap();
    assert_eq!(watched.len(), 1);
    assert_eq!(watched[0].name, "coredns");
}

#[tokio::test]
async fn negative_scale_is_rejected_before_any_call() {
    let mock = Arc::new(MockClient::new());
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);
    let res = client.scale_deployment("default", "web", -1).await;
    assert!(matches!(res, Err(KviewError::InvalidArgument(_))));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn scale_and_delete_pass_through() {
    let mock = Arc::new(MockClient::new());
    mock.seed(ResourceKind::Deployment, vec![object("d1", Some("default"), "web")]);
    mock.seed(ResourceKind::Pod, vec![object("p1", Some("default"), "nginx")]);
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);

    assert_eq!(client.scale_deployment("default", "web", 3).await, Ok(true));
    let deleted = client.delete_object(ResourceKind::Pod, Some("default"), "nginx").await.unwrap();
    assert_eq!(deleted.map(|o| o.uid), Some("p1".to_string()));
    assert_eq!(
        mock.calls(),
        vec![
            "patch Deployment default/web {\"spec\":{\"replicas\":3}}".to_string(),
            "delete Pod default/nginx".to_string(),
        ]
    );

    let missing = client.delete_object(ResourceKind::Pod, Some("default"), "nginx").await;
    assert!(matches!(missing, Err(KviewError::NotFound(_))));
}

#[tokio::test]
async fn list_namespaces_and_request_errors() {
    let mock = Arc::new(MockClient::new());
    mock.seed(
        ResourceKind::Namespace,
        vec![object("n1", None, "default"), object("n2", None, "kube-system")],
    );
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);

    let names: Vec<String> = client.list_namespaces().await.unwrap().into_iter().map(|o| o.name).collect();
    assert_eq!(names, vec!["default".to_string(), "kube-system".to_string()]);

    mock.fail_requests(Some(KviewError::Forbidden("namespaces is forbidden".into())));
    assert!(matches!(client.list_namespaces().await, Err(KviewError::Forbidden(_))));
}

#[tokio::test]
async fn shutdown_stops_watchers_and_the_backend() {
    let mock = Arc::new(MockClient::new());
    let (client, backend) = start(&mock);
    assert!(client.initialize().await);
    client.register_watcher(ResourceKind::Pod, Some("default")).await.unwrap();
    client.register_watcher(ResourceKind::Service, Some("default")).await.unwrap();
    wait_for("watches to open", || mock.opened() == 2).await;

    client.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), backend).await.unwrap().unwrap();
    assert_eq!(mock.dropped(), 2);
    assert!(matches!(client.list_namespaces().await, Err(KviewError::Transport(_))));
}

#[tokio::test]
async fn unread_subscription_does_not_hold_up_replies() {
    let mock = Arc::new(MockClient::new());
    mock.seed(ResourceKind::Namespace, vec![object("n1", None, "default")]);
    let (client, _backend) = start_with(&mock, BridgeConfig { queue_cap: 4, ..config() });
    assert!(client.initialize().await);

    let _stalled = client.on_object_changed(ResourceKind::Pod);
    client.register_watcher(ResourceKind::Pod, Some("default")).await.unwrap();
    wait_for("pod watch to open", || mock.opened() == 1).await;
    let feed = mock.feed(0).unwrap();
    for i in 0..20 {
        let uid = format!("p{}", i);
        feed.send(Ok(RawEvent::Applied(object(&uid, Some("default"), &uid)))).unwrap();
    }

    // every event has crossed the bridge once the channel cache holds all 20
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.list_watched(ResourceKind::Pod).await.unwrap().len() < 20 {
        assert!(tokio::time::Instant::now() < deadline, "pod events did not drain");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let namespaces = client.list_namespaces().await.unwrap();
    assert_eq!(namespaces.len(), 1);
    assert!(matches!(client.scale_deployment("default", "missing", 1).await, Err(KviewError::NotFound(_))));
}

#[tokio::test]
async fn selecting_a_namespace_rebuilds_the_stores() {
    let mock = Arc::new(MockClient::new());
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);
    let mut view = ClusterView::new("default");

    let mut stores = client.select_namespace(&mut view, "default", &[ResourceKind::Pod, ResourceKind::Namespace]).await.unwrap();
    assert_eq!(stores.keys().copied().collect::<Vec<_>>(), vec![ResourceKind::Pod]);
    let old = stores.remove(&ResourceKind::Pod).unwrap();
    wait_for("default watch to open", || mock.opened() == 1).await;
    mock.feed(0)
        .unwrap()
        .send(Ok(RawEvent::Restarted(vec![object("d1", Some("default"), "nginx")])))
        .unwrap();
    wait_store(&old, "d1 in the default store", |s| s.get("d1").is_some()).await;
    assert_eq!(client.subscriptions(), 1);

    let mut stores = client.select_namespace(&mut view, "kube-system", &[ResourceKind::Pod]).await.unwrap();
    assert_eq!(view.namespace(), "kube-system");
    let fresh = stores.remove(&ResourceKind::Pod).unwrap();
    wait_for("kube-system watch to open", || mock.opened() == 2).await;
    wait_for("default watch to be torn down", || mock.dropped() == 1).await;
    assert_eq!(mock.feed_namespace(1), Some(Some("kube-system".to_string())));
    mock.feed(1)
        .unwrap()
        .send(Ok(RawEvent::Restarted(vec![object("k1", Some("kube-system"), "coredns")])))
        .unwrap();
    wait_store(&fresh, "k1 in the kube-system store", |s| s.get("k1").is_some()).await;
    assert_eq!(names(&fresh), vec!["kube-system/coredns".to_string()]);
    assert_eq!(names(&old), vec!["default/nginx".to_string()]);

    assert_eq!(client.subscriptions(), 2);
    drop(old);
    wait_for("old store to unsubscribe", || client.subscriptions() == 1).await;
}

#[tokio::test]
async fn late_event_from_the_replaced_watcher_is_a_harmless_upsert() {
    let mock = Arc::new(MockClient::new());
    let (client, _backend) = start(&mock);
    assert!(client.initialize().await);
    let store = client.watch_store(ResourceKind::Pod);

    client.register_watcher(ResourceKind::Pod, Some("default")).await.unwrap();
    client.register_watcher(ResourceKind::Pod, Some("kube-system")).await.unwrap();
    wait_for("both watches to open", || mock.opened() == 2).await;
    wait_for("old watch to be torn down", || mock.dropped() == 1).await;
    assert!(mock.feed(0).unwrap().send(Ok(RawEvent::Restarted(vec![]))).is_err());

    let feed = mock.feed(1).unwrap();
    feed.send(Ok(RawEvent::Restarted(vec![object("k1", Some("kube-system"), "coredns")]))).unwrap();
    wait_store(&store, "k1", |s| s.get("k1").is_some()).await;
    let k1 = store.current().get("k1").cloned();

    // an ADDED for the old namespace still in flight when the switch happened
    feed.send(Ok(RawEvent::Applied(object("d1", Some("default"), "nginx")))).unwrap();
    wait_store(&store, "late d1", |s| s.get("d1").is_some()).await;
    assert_eq!(names(&store), vec!["default/nginx".to_string(), "kube-system/coredns".to_string()]);
    assert_eq!(store.current().get("k1").cloned(), k1);

    let before = store.current().epoch();
    let listed = names(&store);
    feed.send(Ok(RawEvent::Applied(object("d1", Some("default"), "nginx")))).unwrap();
    wait_store(&store, "repeat of d1", |s| s.epoch() > before).await;
    assert_eq!(names(&store), listed);
}
