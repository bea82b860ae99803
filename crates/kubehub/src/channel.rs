//! Watch channel: one list-then-watch subscription for one collection,
//! translated into added/modified/deleted, connected and error signals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use kview_core::{ChangeEvent, ChangeType, ErrorNotice, ResourceKind, Signal, TrackedObject, Uid, WatcherState};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, RetryPolicy, WatchConfig};
use crate::classify::{classify, Verdict};
use crate::client::{RawEvent, RawEventStream, ResourceClient, WatchError};

/// Why a stop did not wind down cleanly. The channel is stopped either way.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("watcher task did not finish within {0:?}; aborted")]
    Timeout(Duration),
    #[error("watcher task failed: {0}")]
    Join(String),
}

type Cache = Arc<Mutex<FxHashMap<Uid, TrackedObject>>>;

/// Handle to one watch subscription. Owned by the registry while active.
pub struct WatcherHandle {
    id: u64,
    kind: ResourceKind,
    namespace: Option<String>,
    client: Arc<dyn ResourceClient>,
    retry: RetryPolicy,
    stop_timeout: Duration,
    sink: mpsc::Sender<Signal>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<WatcherState>>,
    cache: Cache,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_calls: AtomicU32,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .finish()
    }
}

impl WatcherHandle {
    /// Create an unstarted channel for `kind` scoped to `namespace`
    /// (`None` watches all namespaces, or the cluster scope).
    pub fn new(
        id: u64,
        kind: ResourceKind,
        namespace: Option<String>,
        client: Arc<dyn ResourceClient>,
        config: &WatchConfig,
        sink: mpsc::Sender<Signal>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Unstarted);
        Self {
            id,
            kind,
            namespace,
            client,
            retry: config.retry,
            stop_timeout: config.stop_timeout,
            sink,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            cache: Arc::new(Mutex::new(FxHashMap::default())),
            task: Mutex::new(None),
            stop_calls: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u64 { self.id }
    pub fn kind(&self) -> ResourceKind { self.kind }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn state(&self) -> WatcherState { *self.state.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> { self.state.subscribe() }

    /// How many times stop has been invoked on this handle.
    pub fn stop_calls(&self) -> u32 { self.stop_calls.load(Ordering::SeqCst) }

    /// Objects currently known to this channel.
    pub fn cached(&self) -> Vec<TrackedObject> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    /// Open the stream and spawn the pump. On failure the handle is left in
    /// `Error` with nothing running.
    pub fn start(&self) -> Result<(), WatchError> {
        if self.state() != WatcherState::Unstarted {
            return Err(WatchError::StartFailed(format!("watcher #{} already started", self.id)));
        }
        self.state.send_replace(WatcherState::Starting);
        let stream = match self.client.watch(self.kind, self.namespace.as_deref()) {
            Ok(s) => s,
            Err(e) => {
                self.state.send_replace(WatcherState::Error);
                return Err(match e {
                    WatchError::StartFailed(_) => e,
                    other => WatchError::StartFailed(other.to_string()),
                });
            }
        };
        let pump = Pump {
            id: self.id,
            kind: self.kind,
            namespace: self.namespace.clone(),
            client: Arc::clone(&self.client),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
            cache: Arc::clone(&self.cache),
            backoff: Backoff::new(self.retry),
        };
        let task = tokio::spawn(pump.run(stream));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        info!(id = self.id, kind = %self.kind, ns = %self.namespace.as_deref().unwrap_or("(all)"), "watcher started");
        Ok(())
    }

    /// Stop the channel and wait (bounded) for the pump to finish.
    /// Idempotent; safe on a handle that never started or never connected.
    pub async fn stop(&self) -> Result<(), StopError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            self.state.send_replace(WatcherState::Stopped);
            return Ok(());
        };
        if self.state() != WatcherState::Stopped {
            self.state.send_replace(WatcherState::Stopping);
        }
        let t0 = Instant::now();
        let abort = task.abort_handle();
        let res = match tokio::time::timeout(self.stop_timeout, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StopError::Join(e.to_string())),
            Err(_) => {
                abort.abort();
                Err(StopError::Timeout(self.stop_timeout))
            }
        };
        self.state.send_replace(WatcherState::Stopped);
        counter!("kview_watchers_stopped_total", 1u64, "kind" => self.kind.as_str());
        debug!(id = self.id, kind = %self.kind, took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "watcher stopped");
        res
    }
}

struct Pump {
    id: u64,
    kind: ResourceKind,
    namespace: Option<String>,
    client: Arc<dyn ResourceClient>,
    sink: mpsc::Sender<Signal>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<WatcherState>>,
    cache: Cache,
    backoff: Backoff,
}

impl Pump {
    async fn run(mut self, stream: RawEventStream) {
        let mut stream = Some(stream);
        loop {
            if stream.is_none() {
                // previous stream ended; reopen after backoff
                if !self.pause().await { break; }
                match self.client.watch(self.kind, self.namespace.as_deref()) {
                    Ok(s) => {
                        info!(id = self.id, kind = %self.kind, "watcher reopened");
                        stream = Some(s);
                    }
                    Err(e) => {
                        if !self.fail(e).await { break; }
                    }
                }
                continue;
            }
            let Some(current) = stream.as_mut() else { continue };
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = current.next() => next,
            };
            match next {
                Some(Ok(ev)) => {
                    if !self.on_event(ev).await { break; }
                }
                Some(Err(e)) => {
                    if !self.fail(e).await { break; }
                    if !self.pause().await { break; }
                }
                None => {
                    stream = None;
                    if !self.fail(WatchError::Transport("watch stream ended".into())).await { break; }
                }
            }
        }
        self.state.send_replace(WatcherState::Stopped);
        info!(id = self.id, kind = %self.kind, "watcher pump exited");
    }

    /// Classify and surface an error. Returns false when the pump should exit.
    async fn fail(&mut self, err: WatchError) -> bool {
        match classify(&err, self.cancel.is_cancelled()) {
            Verdict::Suppress => {
                debug!(id = self.id, kind = %self.kind, error = %err, "suppressed watch error");
                counter!("kview_watch_errors_total", 1u64, "verdict" => "suppress");
                !self.cancel.is_cancelled() && err != WatchError::Aborted
            }
            Verdict::Report => {
                warn!(id = self.id, kind = %self.kind, error = %err, "watch error");
                counter!("kview_watch_errors_total", 1u64, "verdict" => "report");
                self.state.send_replace(WatcherState::Error);
                self.emit(Signal::Error(ErrorNotice { kind: Some(self.kind), message: err.to_string() })).await
            }
        }
    }

    /// Sleep for the next backoff delay unless stopped first.
    async fn pause(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(id = self.id, kind = %self.kind, delay_ms = %delay.as_millis(), attempt = self.backoff.attempts(), "watch retry scheduled");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn emit(&self, sig: Signal) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.sink.send(sig) => {
                if res.is_err() { debug!(id = self.id, "signal sink closed; stopping pump"); }
                res.is_ok()
            }
        }
    }

    async fn change(&self, change_type: ChangeType, object: TrackedObject) -> bool {
        self.emit(Signal::ObjectChanged(ChangeEvent { kind: self.kind, change_type, object })).await
    }

    async fn on_event(&mut self, ev: RawEvent) -> bool {
        match ev {
            RawEvent::Applied(obj) => {
                let known = self.remember(&obj);
                let ct = if known { ChangeType::Modified } else { ChangeType::Added };
                self.change(ct, obj).await
            }
            RawEvent::Deleted(obj) => {
                self.cache.lock().unwrap_or_else(PoisonError::into_inner).remove(&obj.uid);
                self.change(ChangeType::Deleted, obj).await
            }
            RawEvent::Restarted(list) => {
                debug!(id = self.id, kind = %self.kind, count = list.len(), "watch relist");
                let seen: FxHashSet<Uid> = list.iter().map(|o| o.uid.clone()).collect();
                let vanished: Vec<TrackedObject> = {
                    let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                    let gone: Vec<Uid> = cache.keys().filter(|k| !seen.contains(*k)).cloned().collect();
                    gone.iter().filter_map(|k| cache.remove(k)).collect()
                };
                for obj in list {
                    let known = self.remember(&obj);
                    let ct = if known { ChangeType::Modified } else { ChangeType::Added };
                    if !self.change(ct, obj).await { return false; }
                }
                for obj in vanished {
                    if !self.change(ChangeType::Deleted, obj).await { return false; }
                }
                self.backoff.reset();
                self.state.send_replace(WatcherState::Connected);
                counter!("kview_watch_connects_total", 1u64, "kind" => self.kind.as_str());
                self.emit(Signal::Connected { kind: self.kind }).await
            }
        }
    }

    /// Insert into the cache; true if the uid was already known.
    fn remember(&self, obj: &TrackedObject) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(obj.uid.clone(), obj.clone())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{object, MockClient};

    fn config() -> WatchConfig {
        WatchConfig { retry: RetryPolicy::Fixed(Duration::from_millis(10)), stop_timeout: Duration::from_secs(1) }
    }

    async fn next(rx: &mut mpsc::Receiver<Signal>) -> Signal {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(s)) => s,
            other => panic!("expected a signal, got {:?}", other),
        }
    }

    fn change(sig: Signal) -> (ChangeType, String) {
        match sig {
            Signal::ObjectChanged(ev) => (ev.change_type, ev.object.uid),
            other => panic!("expected object change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_on_unstarted_handle_is_a_noop() {
        let mock = Arc::new(MockClient::new());
        let (tx, _rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Pod, Some("default".into()), mock.clone(), &config(), tx);
        assert_eq!(h.state(), WatcherState::Unstarted);
        h.stop().await.unwrap();
        h.stop().await.unwrap();
        assert_eq!(h.state(), WatcherState::Stopped);
        assert_eq!(mock.opened(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_after_start() {
        let mock = Arc::new(MockClient::new());
        let (tx, _rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Pod, None, mock.clone(), &config(), tx);
        h.start().unwrap();
        assert_eq!(h.state(), WatcherState::Starting);
        h.stop().await.unwrap();
        h.stop().await.unwrap();
        assert_eq!(h.state(), WatcherState::Stopped);
        assert_eq!(h.stop_calls(), 2);
        assert_eq!(mock.dropped(), 1);
    }

    #[tokio::test]
    async fn translates_applied_into_added_then_modified() {
        let mock = Arc::new(MockClient::new());
        let (tx, mut rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Pod, Some("default".into()), mock.clone(), &config(), tx);
        h.start().unwrap();
        let feed = mock.feed(0).unwrap();
        feed.send(Ok(RawEvent::Restarted(vec![]))).unwrap();
        assert_eq!(next(&mut rx).await, Signal::Connected { kind: ResourceKind::Pod });
        assert_eq!(h.state(), WatcherState::Connected);

        feed.send(Ok(RawEvent::Applied(object("p1", Some("default"), "nginx")))).unwrap();
        feed.send(Ok(RawEvent::Applied(object("p1", Some("default"), "nginx")))).unwrap();
        feed.send(Ok(RawEvent::Deleted(object("p1", Some("default"), "nginx")))).unwrap();
        assert_eq!(change(next(&mut rx).await), (ChangeType::Added, "p1".into()));
        assert_eq!(change(next(&mut rx).await), (ChangeType::Modified, "p1".into()));
        assert_eq!(change(next(&mut rx).await), (ChangeType::Deleted, "p1".into()));
        assert!(h.cached().is_empty());
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn relist_emits_deletes_for_vanished_objects() {
        let mock = Arc::new(MockClient::new());
        let (tx, mut rx) = mpsc::channel(16);
        let h = WatcherHandle::new(1, ResourceKind::Pod, Some("default".into()), mock.clone(), &config(), tx);
        h.start().unwrap();
        let feed = mock.feed(0).unwrap();
        feed.send(Ok(RawEvent::Restarted(vec![object("a", Some("default"), "a"), object("b", Some("default"), "b")])))
            .unwrap();
        assert_eq!(change(next(&mut rx).await), (ChangeType::Added, "a".into()));
        assert_eq!(change(next(&mut rx).await), (ChangeType::Added, "b".into()));
        assert_eq!(next(&mut rx).await, Signal::Connected { kind: ResourceKind::Pod });

        // reconnect: "a" survives, "b" went away while disconnected, "c" is new
        feed.send(Ok(RawEvent::Restarted(vec![object("a", Some("default"), "a"), object("c", Some("default"), "c")])))
            .unwrap();
        assert_eq!(change(next(&mut rx).await), (ChangeType::Modified, "a".into()));
        assert_eq!(change(next(&mut rx).await), (ChangeType::Added, "c".into()));
        assert_eq!(change(next(&mut rx).await), (ChangeType::Deleted, "b".into()));
        assert_eq!(next(&mut rx).await, Signal::Connected { kind: ResourceKind::Pod });

        let mut uids: Vec<String> = h.cached().into_iter().map(|o| o.uid).collect();
        uids.sort();
        assert_eq!(uids, vec!["a".to_string(), "c".to_string()]);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reported_error_reaches_sink_and_watch_resumes() {
        let mock = Arc::new(MockClient::new());
        let (tx, mut rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Service, Some("default".into()), mock.clone(), &config(), tx);
        h.start().unwrap();
        let feed = mock.feed(0).unwrap();
        feed.send(Err(WatchError::Transport("connection refused".into()))).unwrap();
        match next(&mut rx).await {
            Signal::Error(n) => {
                assert_eq!(n.kind, Some(ResourceKind::Service));
                assert!(n.message.contains("connection refused"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.state(), WatcherState::Error);
        feed.send(Ok(RawEvent::Restarted(vec![]))).unwrap();
        assert_eq!(next(&mut rx).await, Signal::Connected { kind: ResourceKind::Service });
        assert_eq!(h.state(), WatcherState::Connected);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn abort_error_is_swallowed_and_ends_the_pump() {
        let mock = Arc::new(MockClient::new());
        let (tx, mut rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Pod, None, mock.clone(), &config(), tx);
        h.start().unwrap();
        mock.feed(0).unwrap().send(Err(WatchError::Aborted)).unwrap();
        let mut state = h.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == WatcherState::Stopped))
            .await
            .unwrap()
            .unwrap();
        assert!(rx.try_recv().is_err());
        h.stop().await.unwrap();
    }

    fn pump(client: Arc<MockClient>, sink: mpsc::Sender<Signal>) -> Pump {
        Pump {
            id: 1,
            kind: ResourceKind::Pod,
            namespace: None,
            client,
            sink,
            cancel: CancellationToken::new(),
            state: Arc::new(watch::channel(WatcherState::Connected).0),
            cache: Cache::default(),
            backoff: Backoff::new(config().retry),
        }
    }

    #[tokio::test]
    async fn errors_raised_after_cancel_are_suppressed_and_end_the_pump() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut p = pump(Arc::new(MockClient::new()), tx);
        assert!(p.fail(WatchError::Transport("connection reset".into())).await);
        assert!(matches!(rx.try_recv(), Ok(Signal::Error(_))));
        assert_eq!(*p.state.borrow(), WatcherState::Error);

        p.state.send_replace(WatcherState::Connected);
        p.cancel.cancel();
        let late = [
            WatchError::Transport("connection reset".into()),
            WatchError::ListFailed("401".into()),
            WatchError::Decode("bad json".into()),
        ];
        for err in late {
            assert!(!p.fail(err).await);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(*p.state.borrow(), WatcherState::Connected);
    }

    #[tokio::test]
    async fn feed_is_gone_once_stop_returns() {
        let mock = Arc::new(MockClient::new());
        let (tx, mut rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Pod, None, mock.clone(), &config(), tx);
        h.start().unwrap();
        let feed = mock.feed(0).unwrap();
        h.stop().await.unwrap();
        // the stream is already gone; a late error has nowhere to go
        assert!(feed.send(Err(WatchError::Transport("socket closed".into()))).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ended_stream_is_reopened_after_backoff() {
        let mock = Arc::new(MockClient::new());
        let (tx, mut rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Deployment, Some("prod".into()), mock.clone(), &config(), tx);
        h.start().unwrap();
        mock.close_feed(0);
        match next(&mut rx).await {
            Signal::Error(n) => assert!(n.message.contains("ended")),
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while mock.opened() < 2 { tokio::time::sleep(Duration::from_millis(5)).await; }
        })
        .await
        .unwrap();
        assert_eq!(mock.feed_namespace(1), Some(Some("prod".to_string())));
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_during_backoff_resolves_promptly() {
        let mock = Arc::new(MockClient::new());
        let (tx, mut rx) = mpsc::channel(8);
        let slow = WatchConfig { retry: RetryPolicy::Fixed(Duration::from_secs(60)), stop_timeout: Duration::from_secs(1) };
        let h = WatcherHandle::new(1, ResourceKind::Pod, None, mock.clone(), &slow, tx);
        h.start().unwrap();
        mock.feed(0).unwrap().send(Err(WatchError::Transport("server restarting".into()))).unwrap();
        assert!(matches!(next(&mut rx).await, Signal::Error(_)));
        let t0 = Instant::now();
        h.stop().await.unwrap();
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert_eq!(h.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn start_failure_leaves_handle_in_error() {
        let mock = Arc::new(MockClient::new());
        mock.fail_watch(true);
        let (tx, _rx) = mpsc::channel(8);
        let h = WatcherHandle::new(1, ResourceKind::Pod, None, mock.clone(), &config(), tx);
        assert!(matches!(h.start(), Err(WatchError::StartFailed(_))));
        assert_eq!(h.state(), WatcherState::Error);
        h.stop().await.unwrap();
        assert_eq!(h.state(), WatcherState::Stopped);
    }
}
