//! In-memory `ResourceClient` for tests. Watch streams are fed by the test
//! through `MockClient::feed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use kview_core::{KviewError, KviewResult, ResourceKind, TrackedObject};
use tokio::sync::mpsc;

use crate::client::{RawEvent, RawEventStream, ResourceClient, WatchError};

pub type FeedSender = mpsc::UnboundedSender<Result<RawEvent, WatchError>>;

/// Build an object the way the API server would report it.
pub fn object(uid: &str, namespace: Option<&str>, name: &str) -> TrackedObject {
    let mut meta = serde_json::json!({ "uid": uid, "name": name, "resourceVersion": "1" });
    if let Some(ns) = namespace { meta["namespace"] = serde_json::Value::String(ns.to_string()); }
    let raw = serde_json::json!({ "metadata": meta, "spec": {}, "status": {} });
    match TrackedObject::from_raw(raw) {
        Ok(o) => o,
        Err(e) => panic!("mock object is malformed: {}", e),
    }
}

struct DropGuard(Arc<AtomicUsize>);

impl Drop for DropGuard {
    fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

#[derive(Default)]
pub struct MockClient {
    objects: Mutex<HashMap<ResourceKind, Vec<TrackedObject>>>,
    feeds: Mutex<Vec<(ResourceKind, Option<String>, Option<FeedSender>)>>,
    calls: Mutex<Vec<String>>,
    opened: AtomicUsize,
    dropped: Arc<AtomicUsize>,
    fail_watch: AtomicBool,
    fail_requests: Mutex<Option<KviewError>>,
}

impl MockClient {
    pub fn new() -> Self { Self::default() }

    pub fn seed(&self, kind: ResourceKind, items: Vec<TrackedObject>) {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).insert(kind, items);
    }

    /// Make every subsequent `watch` call fail synchronously.
    pub fn fail_watch(&self, on: bool) { self.fail_watch.store(on, Ordering::SeqCst); }

    /// Make every subsequent request fail with `err`.
    pub fn fail_requests(&self, err: Option<KviewError>) {
        *self.fail_requests.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    /// Sender feeding the `idx`-th opened watch stream.
    pub fn feed(&self, idx: usize) -> Option<FeedSender> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).get(idx).and_then(|(_, _, tx)| tx.clone())
    }

    /// End the `idx`-th watch stream once every outstanding feed clone is dropped.
    pub fn close_feed(&self, idx: usize) {
        if let Some(entry) = self.feeds.lock().unwrap_or_else(PoisonError::into_inner).get_mut(idx) {
            entry.2 = None;
        }
    }

    /// Namespace the `idx`-th watch stream was opened for.
    pub fn feed_namespace(&self, idx: usize) -> Option<Option<String>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).get(idx).map(|(_, ns, _)| ns.clone())
    }

    /// Number of watch streams opened so far.
    pub fn opened(&self) -> usize { self.opened.load(Ordering::SeqCst) }

    /// Number of watch streams torn down so far.
    pub fn dropped(&self) -> usize { self.dropped.load(Ordering::SeqCst) }

    /// Request log, one line per call that reached the client.
    pub fn calls(&self) -> Vec<String> { self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    fn record(&self, line: String) -> KviewResult<()> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(line);
        match self.fail_requests.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn find(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Option<TrackedObject> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(&kind)?
            .iter()
            .find(|o| o.name == name && (!kind.namespaced() || o.namespace.as_deref() == namespace))
            .cloned()
    }
}

fn target(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

fn merge(into: &mut serde_json::Value, patch: &serde_json::Value) {
    match (into, patch) {
        (serde_json::Value::Object(dst), serde_json::Value::Object(src)) => {
            for (k, v) in src {
                if v.is_null() {
                    dst.remove(k);
                } else {
                    merge(dst.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

#[async_trait::async_trait]
impl ResourceClient for MockClient {
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> KviewResult<Vec<TrackedObject>> {
        self.record(format!("list {} {}", kind, namespace.unwrap_or("*")))?;
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|o| namespace.is_none() || !kind.namespaced() || o.namespace.as_deref() == namespace)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> KviewResult<TrackedObject> {
        self.record(format!("get {} {}", kind, target(namespace, name)))?;
        self.find(kind, namespace, name)
            .ok_or_else(|| KviewError::NotFound(format!("{} {}", kind, target(namespace, name))))
    }

    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> KviewResult<Option<TrackedObject>> {
        self.record(format!("delete {} {}", kind, target(namespace, name)))?;
        let found = self
            .find(kind, namespace, name)
            .ok_or_else(|| KviewError::NotFound(format!("{} {}", kind, target(namespace, name))))?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(items) = objects.get_mut(&kind) { items.retain(|o| o.uid != found.uid); }
        Ok(Some(found))
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: serde_json::Value,
    ) -> KviewResult<TrackedObject> {
        self.record(format!("patch {} {} {}", kind, target(namespace, name), patch))?;
        let mut found = self
            .find(kind, namespace, name)
            .ok_or_else(|| KviewError::NotFound(format!("{} {}", kind, target(namespace, name))))?;
        merge(&mut found.raw, &patch);
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(items) = objects.get_mut(&kind) {
            for o in items.iter_mut() {
                if o.uid == found.uid { *o = found.clone(); }
            }
        }
        Ok(found)
    }

    fn watch(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<RawEventStream, WatchError> {
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(WatchError::StartFailed(format!("mock refused {}", kind.collection_path(namespace))));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, namespace.map(|s| s.to_string()), Some(tx)));
        self.opened.fetch_add(1, Ordering::SeqCst);
        let guard = DropGuard(Arc::clone(&self.dropped));
        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        });
        Ok(stream.boxed())
    }
}
