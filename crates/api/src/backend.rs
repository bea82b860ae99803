//! Privileged end of the bridge: owns the cluster session and answers
//! commands.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use kview_core::{KviewError, KviewResult, ResourceKind, Signal, TrackedObject};
use kview_kubehub::{scale_deployment, KubeResourceClient, ResourceClient, WatchConfig, WatcherRegistry};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::{decode, encode, Command, Frame, Reply};
use crate::{BackendEndpoint, BridgeConfig};

/// Establishes cluster access for `initialize`.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self) -> KviewResult<Arc<dyn ResourceClient>>;
}

/// Connects with the operator's kubeconfig (or in-cluster config).
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait::async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self) -> KviewResult<Arc<dyn ResourceClient>> {
        let client = KubeResourceClient::try_default().await?;
        client.probe().await?;
        Ok(Arc::new(client))
    }
}

/// Hands out a prepared client, or refuses when built with `failing`.
#[derive(Clone)]
pub struct StaticConnector {
    client: Option<Arc<dyn ResourceClient>>,
}

impl StaticConnector {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client: Some(client) } }
    pub fn failing() -> Self { Self { client: None } }
}

#[async_trait::async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self) -> KviewResult<Arc<dyn ResourceClient>> {
        self.client.clone().ok_or_else(|| KviewError::Config("no cluster configured".into()))
    }
}

type RegisterRequest = (ResourceKind, Option<String>);

/// Everything built by a successful `initialize`: the resource client, the
/// watcher registry and the queue feeding it register requests in order.
pub struct Session {
    id: Uuid,
    client: Arc<dyn ResourceClient>,
    registry: Arc<WatcherRegistry>,
    register_tx: Mutex<Option<mpsc::Sender<RegisterRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(client: Arc<dyn ResourceClient>, watch: WatchConfig, queue_cap: usize, signals: mpsc::Sender<Signal>) -> Self {
        let id = Uuid::new_v4();
        let registry = Arc::new(WatcherRegistry::new(Arc::clone(&client), watch));
        let (register_tx, mut register_rx) = mpsc::channel::<RegisterRequest>(queue_cap);
        let worker_registry = Arc::clone(&registry);
        let worker = tokio::spawn(async move {
            while let Some((kind, namespace)) = register_rx.recv().await {
                // failures are already signalled by the registry
                if let Err(e) = worker_registry.register(kind, namespace, signals.clone()).await {
                    debug!(session = %id, kind = %kind, error = %e, "register failed");
                }
            }
            debug!(session = %id, "register worker stopped");
        });
        info!(session = %id, "session created");
        Self {
            id,
            client,
            registry,
            register_tx: Mutex::new(Some(register_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn id(&self) -> Uuid { self.id }

    pub fn client(&self) -> Arc<dyn ResourceClient> { Arc::clone(&self.client) }

    pub fn registry(&self) -> &WatcherRegistry { &self.registry }

    /// Queue a register; it runs after every register queued before it.
    pub async fn register(&self, kind: ResourceKind, namespace: Option<String>) -> KviewResult<()> {
        let tx = self.register_tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(tx) = tx else {
            return Err(KviewError::NotInitialized("session is shut down".into()));
        };
        tx.send((kind, namespace))
            .await
            .map_err(|_| KviewError::Internal("register worker is gone".into()))
    }

    pub async fn list_watched(&self, kind: ResourceKind) -> Vec<TrackedObject> {
        let mut items = self.registry.cached(kind).await.unwrap_or_default();
        items.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        items
    }

    /// Drain queued registers, then stop every watcher.
    pub async fn shutdown(&self) {
        drop(self.register_tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(session = %self.id, error = %e, "register worker panicked");
            }
        }
        self.registry.stop_all().await;
        info!(session = %self.id, "session shut down");
    }
}

/// Answers commands arriving on a `BackendEndpoint`.
pub struct Backend {
    connector: Arc<dyn ClusterConnector>,
    config: BridgeConfig,
}

impl Backend {
    pub fn new(connector: Arc<dyn ClusterConnector>, config: BridgeConfig) -> Self { Self { connector, config } }

    pub fn spawn(self, endpoint: BackendEndpoint) -> JoinHandle<()> { tokio::spawn(self.serve(endpoint)) }

    /// Serve until a `shutdown` command arrives or the client goes away.
    pub async fn serve(self, endpoint: BackendEndpoint) {
        let BackendEndpoint { mut inbound, outbound } = endpoint;
        let (signal_tx, mut signal_rx) = mpsc::channel::<Signal>(self.config.queue_cap);
        let signal_out = outbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                match encode(&Frame::Signal { signal }) {
                    Ok(bytes) => {
                        if signal_out.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "dropping signal"),
                }
            }
        });

        let mut session: Option<Arc<Session>> = None;
        while let Some(bytes) = inbound.recv().await {
            let (id, command) = match decode(&bytes) {
                Ok(Frame::Request { id, command }) => (id, command),
                Ok(other) => {
                    warn!(frame = ?other, "unexpected frame on command channel");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "undecodable frame");
                    continue;
                }
            };
            counter!("kview_bridge_requests_total", 1u64, "command" => command.name());
            debug!(%id, command = command.name(), "request");

            match command {
                Command::Initialize => {
                    let reply = self.initialize(&mut session, &signal_tx).await;
                    respond(&outbound, id, reply).await;
                }
                Command::Shutdown => {
                    if let Some(old) = session.take() {
                        old.shutdown().await;
                    }
                    respond(&outbound, id, Reply::Accepted).await;
                    break;
                }
                command => {
                    let Some(current) = session.clone() else {
                        let msg = format!("{} before initialize", command.name());
                        warn!(%id, "{}", msg);
                        respond(&outbound, id, Reply::Failed(KviewError::NotInitialized(msg))).await;
                        continue;
                    };
                    match command {
                        // answered once queued; the watch itself reports through signals
                        Command::RegisterWatcher { kind, namespace } => {
                            let reply = match current.register(kind, namespace).await {
                                Ok(()) => Reply::Accepted,
                                Err(e) => Reply::Failed(e),
                            };
                            respond(&outbound, id, reply).await;
                        }
                        command => {
                            let out = outbound.clone();
                            tokio::spawn(async move {
                                let reply = dispatch(&current, command).await;
                                respond(&out, id, reply).await;
                            });
                        }
                    }
                }
            }
        }

        if let Some(old) = session.take() {
            old.shutdown().await;
        }
        drop(signal_tx);
        if let Err(e) = forwarder.await {
            warn!(error = %e, "signal forwarder panicked");
        }
        info!("backend stopped");
    }

    async fn initialize(&self, session: &mut Option<Arc<Session>>, signals: &mpsc::Sender<Signal>) -> Reply {
        let t0 = Instant::now();
        match self.connector.connect().await {
            Ok(client) => {
                if let Some(old) = session.take() {
                    old.shutdown().await;
                }
                let next = Session::new(client, self.config.watch.clone(), self.config.queue_cap, signals.clone());
                info!(session = %next.id(), took_ms = %t0.elapsed().as_millis(), "initialize ok");
                *session = Some(Arc::new(next));
                Reply::Initialized(true)
            }
            Err(e) => {
                warn!(error = %e, took_ms = %t0.elapsed().as_millis(), "initialize failed");
                Reply::Initialized(false)
            }
        }
    }
}

/// Request/response commands; each runs on its own task.
async fn dispatch(session: &Session, command: Command) -> Reply {
    let t0 = Instant::now();
    let command_name = command.name();
    let client = session.client();
    let reply = match command {
        Command::ListNamespaces => match client.list(ResourceKind::Namespace, None).await {
            Ok(items) => Reply::Objects(items),
            Err(e) => Reply::Failed(e),
        },
        Command::ListWatched { kind } => Reply::Objects(session.list_watched(kind).await),
        Command::DeleteObject { kind, namespace, name } => {
            match client.delete(kind, namespace.as_deref(), &name).await {
                Ok(obj) => Reply::Deleted(obj),
                Err(e) => Reply::Failed(e),
            }
        }
        Command::ScaleDeployment { namespace, name, replicas } => {
            match scale_deployment(client.as_ref(), &namespace, &name, replicas).await {
                Ok(_) => Reply::Scaled(true),
                Err(e) => Reply::Failed(e),
            }
        }
        other => Reply::Failed(KviewError::Internal(format!("{} is not a request/response command", other.name()))),
    };
    match &reply {
        Reply::Failed(e) => warn!(command = command_name, error = %e, took_ms = %t0.elapsed().as_millis(), "request failed"),
        _ => info!(command = command_name, took_ms = %t0.elapsed().as_millis(), "request ok"),
    }
    reply
}

async fn respond(out: &mpsc::Sender<Vec<u8>>, id: Uuid, reply: Reply) {
    match encode(&Frame::Response { id, reply }) {
        Ok(bytes) => {
            if out.send(bytes).await.is_err() {
                debug!(%id, "client gone; response dropped");
            }
        }
        Err(e) => error!(%id, error = %e, "response not encodable"),
    }
}
