//! Presentation end of the bridge.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kview_core::{ChangeEvent, ErrorNotice, KviewError, KviewResult, ResourceKind, Signal, TrackedObject};
use kview_kubehub::validate_replicas;
use kview_store::{spawn_ingest, ClusterView, StoreHandle};
use metrics::counter;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{decode, encode, Command, Frame, Reply};
use crate::BridgeConfig;

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Reply>>>>;

enum Subscriber {
    Objects(ResourceKind, mpsc::Sender<ChangeEvent>),
    Connected(mpsc::Sender<ResourceKind>),
    Errors(mpsc::Sender<ErrorNotice>),
    All(mpsc::Sender<Signal>),
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        match self {
            Subscriber::Objects(_, tx) => tx.is_closed(),
            Subscriber::Connected(tx) => tx.is_closed(),
            Subscriber::Errors(tx) => tx.is_closed(),
            Subscriber::All(tx) => tx.is_closed(),
        }
    }
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

/// Front-end handle: issues commands and hands out signal subscriptions.
pub struct BridgeClient {
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    subscribers: Subscribers,
    request_timeout: Duration,
    queue_cap: usize,
    reader: JoinHandle<()>,
}

impl BridgeClient {
    pub(crate) fn new(outbound: mpsc::Sender<Vec<u8>>, inbound: mpsc::Receiver<Vec<u8>>, config: &BridgeConfig) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let reader = tokio::spawn(read_loop(inbound, Arc::clone(&pending), Arc::clone(&subscribers)));
        Self {
            outbound,
            pending,
            subscribers,
            request_timeout: config.request_timeout,
            queue_cap: config.queue_cap,
            reader,
        }
    }

    async fn request(&self, command: Command) -> KviewResult<Reply> {
        let t0 = Instant::now();
        let name = command.name();
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);
        let sent = match encode(&Frame::Request { id, command }) {
            Ok(bytes) => self.outbound.send(bytes).await.map_err(|_| KviewError::Transport("bridge closed".into())),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.forget(&id);
            return Err(e);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => {
                debug!(%id, command = name, took_ms = %t0.elapsed().as_millis(), "reply received");
                Ok(reply)
            }
            Ok(Err(_)) => Err(KviewError::Transport("bridge closed before reply".into())),
            Err(_) => {
                self.forget(&id);
                Err(KviewError::Transport(format!("{} timed out after {}s", name, self.request_timeout.as_secs())))
            }
        }
    }

    fn forget(&self, id: &Uuid) { self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(id); }

    /// Establish cluster access on the privileged side. Never fails: any
    /// problem, including a dead bridge, is reported as `false`.
    pub async fn initialize(&self) -> bool {
        match self.request(Command::Initialize).await {
            Ok(Reply::Initialized(ok)) => {
                info!(ok, "initialize");
                ok
            }
            Ok(other) => {
                warn!(reply = ?other, "unexpected reply to initialize");
                false
            }
            Err(e) => {
                warn!(error = %e, "initialize failed");
                false
            }
        }
    }

    /// Ask for a watcher on `kind` in `namespace`. Returns once the request
    /// is queued; objects, connection and errors arrive as signals.
    pub async fn register_watcher(&self, kind: ResourceKind, namespace: Option<&str>) -> KviewResult<()> {
        let namespace = if kind.namespaced() { namespace.map(|s| s.to_string()) } else { None };
        match self.request(Command::RegisterWatcher { kind, namespace }).await? {
            Reply::Accepted => Ok(()),
            other => Err(other.into_error("register_watcher")),
        }
    }

    pub async fn list_namespaces(&self) -> KviewResult<Vec<TrackedObject>> {
        match self.request(Command::ListNamespaces).await? {
            Reply::Objects(items) => Ok(items),
            other => Err(other.into_error("list_namespaces")),
        }
    }

    /// Objects the active watcher for `kind` holds (empty without one).
    pub async fn list_watched(&self, kind: ResourceKind) -> KviewResult<Vec<TrackedObject>> {
        match self.request(Command::ListWatched { kind }).await? {
            Reply::Objects(items) => Ok(items),
            other => Err(other.into_error("list_watched")),
        }
    }

    /// The local snapshot is not touched; the DELETED signal does that.
    pub async fn delete_object(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> KviewResult<Option<TrackedObject>> {
        let command = Command::DeleteObject { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() };
        match self.request(command).await? {
            Reply::Deleted(obj) => Ok(obj),
            other => Err(other.into_error("delete_object")),
        }
    }

    /// Negative counts are refused here, before anything is sent.
    pub async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i64) -> KviewResult<bool> {
        validate_replicas(replicas)?;
        let command = Command::ScaleDeployment { namespace: namespace.to_string(), name: name.to_string(), replicas };
        match self.request(command).await? {
            Reply::Scaled(ok) => Ok(ok),
            other => Err(other.into_error("scale_deployment")),
        }
    }

    /// Stop every watcher and end the backend.
    pub async fn shutdown(&self) -> KviewResult<()> {
        match self.request(Command::Shutdown).await? {
            Reply::Accepted => Ok(()),
            other => Err(other.into_error("shutdown")),
        }
    }

    fn subscribe(&self, sub: Subscriber) { self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(sub); }

    /// Change events for one kind, in arrival order.
    pub fn on_object_changed(&self, kind: ResourceKind) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(self.queue_cap);
        self.subscribe(Subscriber::Objects(kind, tx));
        rx
    }

    /// One item per successful (re)connection, tagged with the kind.
    pub fn on_connected(&self) -> mpsc::Receiver<ResourceKind> {
        let (tx, rx) = mpsc::channel(self.queue_cap);
        self.subscribe(Subscriber::Connected(tx));
        rx
    }

    pub fn on_error(&self) -> mpsc::Receiver<ErrorNotice> {
        let (tx, rx) = mpsc::channel(self.queue_cap);
        self.subscribe(Subscriber::Errors(tx));
        rx
    }

    /// Every signal, untyped, in arrival order.
    pub fn subscribe_all(&self) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(self.queue_cap);
        self.subscribe(Subscriber::All(tx));
        rx
    }

    /// Reconciled snapshot of `kind`, fed by this client's signals. The
    /// ingest task and its subscription end once every clone of the handle
    /// is dropped.
    pub fn watch_store(&self, kind: ResourceKind) -> StoreHandle { spawn_ingest(kind, self.on_object_changed(kind)) }

    /// Switch the namespaced kinds in `kinds` over to `namespace`.
    ///
    /// `view` drops its namespaced objects, then each kind gets a fresh store
    /// and its watcher is re-registered, so the new stores fill from the new
    /// watchers' initial lists. Cluster-scoped kinds are left alone. Drop the
    /// stores of the previous selection to stop their ingest.
    pub async fn select_namespace(
        &self,
        view: &mut ClusterView,
        namespace: &str,
        kinds: &[ResourceKind],
    ) -> KviewResult<BTreeMap<ResourceKind, StoreHandle>> {
        view.select_namespace(namespace);
        let mut stores = BTreeMap::new();
        for kind in kinds.iter().copied().filter(|k| k.namespaced()) {
            stores.insert(kind, self.watch_store(kind));
            self.register_watcher(kind, Some(namespace)).await?;
        }
        info!(ns = %namespace, kinds = stores.len(), "namespace selected");
        Ok(stores)
    }

    /// Live subscriptions; closed ones are pruned first.
    pub fn subscriptions(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|s| !s.is_closed());
        subs.len()
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) { self.reader.abort(); }
}

async fn read_loop(mut inbound: mpsc::Receiver<Vec<u8>>, pending: Pending, subscribers: Subscribers) {
    while let Some(bytes) = inbound.recv().await {
        match decode(&bytes) {
            Ok(Frame::Response { id, reply }) => {
                let waiter = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(%id, "reply for unknown or expired request"),
                }
            }
            Ok(Frame::Signal { signal }) => deliver(&subscribers, signal),
            Ok(other) => warn!(frame = ?other, "unexpected frame from backend"),
            Err(e) => warn!(error = %e, "undecodable frame from backend"),
        }
    }
    // backend gone: fail every outstanding request
    pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    debug!("bridge reader stopped");
}

/// Never waits on a subscriber: a full queue loses the signal for that
/// subscriber only, so replies keep flowing behind a stalled reader.
fn deliver(subscribers: &Subscribers, signal: Signal) {
    let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    subs.retain(|s| !s.is_closed());
    for sub in subs.iter() {
        match (sub, &signal) {
            (Subscriber::Objects(kind, tx), Signal::ObjectChanged(ev)) if *kind == ev.kind => offer(tx, ev.clone(), "object"),
            (Subscriber::Connected(tx), Signal::Connected { kind }) => offer(tx, *kind, "connected"),
            (Subscriber::Errors(tx), Signal::Error(notice)) => offer(tx, notice.clone(), "error"),
            (Subscriber::All(tx), s) => offer(tx, s.clone(), "all"),
            _ => {}
        }
    }
}

fn offer<T>(tx: &mpsc::Sender<T>, item: T, subscription: &'static str) {
    match tx.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(subscription, "subscriber queue full; signal dropped");
            counter!("kview_bridge_signals_dropped_total", 1u64, "subscription" => subscription);
        }
        // pruned on the next signal
        Err(TrySendError::Closed(_)) => debug!(subscription, "subscriber closed during delivery"),
    }
}
