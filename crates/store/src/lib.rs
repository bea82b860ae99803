//! kview store: per-kind snapshots rebuilt from change events.
//!
//! A `Snapshot` is mutated only by `apply`, in arrival order, keyed by uid.
//! `spawn_ingest` runs that loop on a task and publishes frozen copies for
//! readers; `ClusterView` is the single-threaded model a front-end keeps.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kview_core::{ChangeEvent, ChangeType, ResourceKind, Signal, TrackedObject, Uid};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Removed,
    /// DELETED for an unknown uid, or an event of another kind.
    Ignored,
}

/// Current reconciled view of one resource kind.
#[derive(Debug, Clone)]
pub struct Snapshot {
    kind: ResourceKind,
    epoch: u64,
    items: FxHashMap<Uid, TrackedObject>,
}

impl Snapshot {
    pub fn new(kind: ResourceKind) -> Self { Self { kind, epoch: 0, items: FxHashMap::default() } }

    pub fn kind(&self) -> ResourceKind { self.kind }

    /// Number of publishes that produced this copy (0 for a fresh snapshot).
    pub fn epoch(&self) -> u64 { self.epoch }

    /// ADDED/MODIFIED replace the whole object; DELETED removes it.
    pub fn apply(&mut self, ev: &ChangeEvent) -> ApplyOutcome {
        if ev.kind != self.kind {
            debug!(expected = %self.kind, got = %ev.kind, "event for another kind ignored");
            return ApplyOutcome::Ignored;
        }
        match ev.change_type {
            ChangeType::Added | ChangeType::Modified => {
                match self.items.insert(ev.object.uid.clone(), ev.object.clone()) {
                    Some(_) => ApplyOutcome::Replaced,
                    None => ApplyOutcome::Inserted,
                }
            }
            ChangeType::Deleted => match self.items.remove(&ev.object.uid) {
                Some(_) => ApplyOutcome::Removed,
                None => ApplyOutcome::Ignored,
            },
        }
    }

    pub fn get(&self, uid: &str) -> Option<&TrackedObject> { self.items.get(uid) }

    /// First object with this name (and namespace, when given).
    pub fn find(&self, namespace: Option<&str>, name: &str) -> Option<&TrackedObject> {
        self.items
            .values()
            .find(|o| o.name == name && (namespace.is_none() || o.namespace.as_deref() == namespace))
    }

    /// All objects ordered by namespace, name, uid.
    pub fn list(&self) -> Vec<&TrackedObject> {
        let mut out: Vec<&TrackedObject> = self.items.values().collect();
        out.sort_by(|a, b| (&a.namespace, &a.name, &a.uid).cmp(&(&b.namespace, &b.name, &b.uid)));
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedObject> { self.items.values() }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn clear(&mut self) { self.items.clear(); }
}

/// Connection indicator shown by the front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnStatus {
    pub connected: bool,
    pub message: String,
}

impl Default for ConnStatus {
    fn default() -> Self { Self { connected: false, message: "Loading".into() } }
}

/// Everything the presentation side knows about the cluster: one snapshot
/// per kind, the selected namespace and the connection status.
#[derive(Debug, Clone)]
pub struct ClusterView {
    namespace: String,
    status: ConnStatus,
    snapshots: BTreeMap<ResourceKind, Snapshot>,
    namespaces: Vec<String>,
}

impl Default for ClusterView {
    fn default() -> Self { Self::new("default") }
}

impl ClusterView {
    pub fn new(namespace: impl Into<String>) -> Self {
        let snapshots = ResourceKind::ALL.iter().map(|k| (*k, Snapshot::new(*k))).collect();
        Self { namespace: namespace.into(), status: ConnStatus::default(), snapshots, namespaces: Vec::new() }
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn status(&self) -> &ConnStatus { &self.status }

    /// Switch the selected namespace. Namespaced snapshots are dropped, since
    /// the watchers for the new namespace replay everything from a fresh list.
    /// Returns false when `namespace` is already selected.
    pub fn select_namespace(&mut self, namespace: &str) -> bool {
        if self.namespace == namespace {
            return false;
        }
        for (kind, snap) in self.snapshots.iter_mut() {
            if kind.namespaced() { snap.clear(); }
        }
        info!(from = %self.namespace, to = %namespace, "namespace selection changed");
        self.namespace = namespace.to_string();
        self.status = ConnStatus::default();
        true
    }

    /// Apply one bridge signal. Returns the outcome for object changes.
    pub fn handle_signal(&mut self, signal: &Signal) -> Option<ApplyOutcome> {
        match signal {
            Signal::ObjectChanged(ev) => {
                let snap = self.snapshots.entry(ev.kind).or_insert_with(|| Snapshot::new(ev.kind));
                let outcome = snap.apply(ev);
                counter!("kview_store_applied_total", 1u64, "kind" => ev.kind.as_str());
                Some(outcome)
            }
            Signal::Connected { .. } => {
                self.status = ConnStatus { connected: true, message: "Connected".into() };
                None
            }
            Signal::Error(notice) => {
                self.status = ConnStatus { connected: false, message: notice.message.clone() };
                None
            }
        }
    }

    /// Replace the namespace list (from a list-namespaces reply).
    pub fn seed_namespaces(&mut self, items: &[TrackedObject]) {
        let mut names: Vec<String> = items.iter().map(|o| o.name.clone()).collect();
        names.sort_unstable();
        names.dedup();
        self.namespaces = names;
    }

    pub fn namespaces(&self) -> &[String] { &self.namespaces }

    pub fn snapshot(&self, kind: ResourceKind) -> Option<&Snapshot> { self.snapshots.get(&kind) }
}

/// Read side of an ingest loop.
#[derive(Clone)]
pub struct StoreHandle {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StoreHandle {
    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

/// Spawn a task applying `rx` to a snapshot of `kind`. Events are applied
/// one by one in arrival order; whatever is already queued is applied before
/// the next publish. The task ends when `rx` closes or when every handle
/// (and every epoch receiver taken from one) is dropped, which also drops
/// `rx`.
pub fn spawn_ingest(kind: ResourceKind, mut rx: mpsc::Receiver<ChangeEvent>) -> StoreHandle {
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::new(kind)));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let published = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut working = Snapshot::new(kind);
        loop {
            let ev = tokio::select! {
                biased;
                _ = epoch_tx.closed() => {
                    debug!(kind = %kind, "every store handle dropped");
                    break;
                }
                maybe = rx.recv() => match maybe {
                    Some(ev) => ev,
                    None => break,
                },
            };
            working.apply(&ev);
            let mut batch = 1usize;
            while let Ok(ev) = rx.try_recv() {
                working.apply(&ev);
                batch += 1;
            }
            working.epoch = working.epoch.saturating_add(1);
            let epoch = working.epoch;
            published.store(Arc::new(working.clone()));
            let _ = epoch_tx.send(epoch);
            debug!(kind = %kind, batch, epoch, items = working.len(), "snapshot published");
        }
        info!(kind = %kind, "ingest loop stopped");
    });

    StoreHandle { snap, epoch_rx }
}
