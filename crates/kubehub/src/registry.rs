//! Watcher registry: at most one live watch channel per resource kind.
//!
//! Every transition of the active slot goes through `register`/`stop`,
//! serialized by an async mutex. A register stops the previous handle and
//! waits for it before the new channel is opened; a second register that
//! arrives meanwhile queues behind the first and then replaces its handle
//! the same way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kview_core::{ErrorNotice, ResourceKind, Signal, TrackedObject, WatcherState};
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::backoff::WatchConfig;
use crate::channel::WatcherHandle;
use crate::client::{ResourceClient, WatchError};

/// Read-only view of the active watcher for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherInfo {
    pub id: u64,
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub state: WatcherState,
}

pub struct WatcherRegistry {
    client: Arc<dyn ResourceClient>,
    config: WatchConfig,
    active: Mutex<HashMap<ResourceKind, Arc<WatcherHandle>>>,
    next_id: AtomicU64,
}

impl WatcherRegistry {
    pub fn new(client: Arc<dyn ResourceClient>, config: WatchConfig) -> Self {
        Self { client, config, active: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Replace the watcher for `kind` with a fresh one scoped to `namespace`.
    ///
    /// Start failures are sent to `sink` as an error signal and returned; the
    /// slot is left empty so the next register can proceed normally.
    pub async fn register(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        sink: mpsc::Sender<Signal>,
    ) -> Result<u64, WatchError> {
        let t0 = Instant::now();
        let mut active = self.active.lock().await;
        if let Some(old) = active.remove(&kind) {
            info!(kind = %kind, old_id = old.id(), "stopping existing watcher before registering new one");
            match old.stop().await {
                Ok(()) => info!(kind = %kind, old_id = old.id(), "stopped existing watcher"),
                Err(e) => warn!(kind = %kind, old_id = old.id(), error = %e, "error stopping existing watcher; abandoning it"),
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(WatcherHandle::new(id, kind, namespace, Arc::clone(&self.client), &self.config, sink.clone()));
        match handle.start() {
            Ok(()) => {
                active.insert(kind, handle);
                counter!("kview_watchers_started_total", 1u64, "kind" => kind.as_str());
                info!(kind = %kind, id, took_ms = %t0.elapsed().as_millis(), "watcher registered");
                Ok(id)
            }
            Err(e) => {
                error!(kind = %kind, id, error = %e, "error starting watcher");
                drop(active);
                let notice = ErrorNotice { kind: Some(kind), message: e.to_string() };
                if sink.send(Signal::Error(notice)).await.is_err() {
                    warn!(kind = %kind, "signal sink closed; start failure not delivered");
                }
                Err(e)
            }
        }
    }

    /// Stop and forget the watcher for `kind`. Returns false if none was active.
    pub async fn stop(&self, kind: ResourceKind) -> bool {
        let mut active = self.active.lock().await;
        let Some(handle) = active.remove(&kind) else { return false };
        if let Err(e) = handle.stop().await {
            warn!(kind = %kind, id = handle.id(), error = %e, "error stopping watcher");
        }
        true
    }

    pub async fn stop_all(&self) {
        let mut active = self.active.lock().await;
        for (kind, handle) in active.drain() {
            if let Err(e) = handle.stop().await {
                warn!(kind = %kind, id = handle.id(), error = %e, "error stopping watcher");
            }
        }
        info!("all watchers stopped");
    }

    pub async fn info(&self, kind: ResourceKind) -> Option<WatcherInfo> {
        let active = self.active.lock().await;
        active.get(&kind).map(|h| WatcherInfo {
            id: h.id(),
            kind,
            namespace: h.namespace().map(|s| s.to_string()),
            state: h.state(),
        })
    }

    /// The active handle itself, for callers that need to observe its state.
    pub async fn handle(&self, kind: ResourceKind) -> Option<Arc<WatcherHandle>> {
        self.active.lock().await.get(&kind).cloned()
    }

    pub async fn active_count(&self) -> usize { self.active.lock().await.len() }

    /// Objects the active watcher for `kind` currently knows about.
    pub async fn cached(&self, kind: ResourceKind) -> Option<Vec<TrackedObject>> {
        self.active.lock().await.get(&kind).map(|h| h.cached())
    }
}
