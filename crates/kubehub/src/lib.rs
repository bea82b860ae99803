//! kview kubehub: the cluster side of the watch subsystem.
//!
//! `KubeResourceClient` is the kube-rs backed `ResourceClient`; watch
//! channels and the registry only see the trait.

#![forbid(unsafe_code)]

use std::time::Instant;

use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    runtime::watcher::{self, Event},
    Client,
};
use kview_core::{KviewError, KviewResult, ResourceKind, TrackedObject};
use tracing::{debug, info};

pub mod backoff;
pub mod channel;
pub mod classify;
pub mod client;
pub mod mock;
pub mod registry;

pub use backoff::{Backoff, RetryPolicy, WatchConfig};
pub use channel::{StopError, WatcherHandle};
pub use classify::{classify, Verdict};
pub use client::{scale_deployment, validate_replicas, RawEvent, RawEventStream, ResourceClient, WatchError};
pub use registry::{WatcherInfo, WatcherRegistry};

fn api_resource(kind: ResourceKind) -> ApiResource {
    use k8s_openapi::api::{apps::v1 as appsv1, core::v1 as corev1};
    match kind {
        ResourceKind::Namespace => ApiResource::erase::<corev1::Namespace>(&()),
        ResourceKind::Pod => ApiResource::erase::<corev1::Pod>(&()),
        ResourceKind::Service => ApiResource::erase::<corev1::Service>(&()),
        ResourceKind::Deployment => ApiResource::erase::<appsv1::Deployment>(&()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn tracked(obj: &DynamicObject) -> Result<TrackedObject, String> {
    let mut raw = serde_json::to_value(obj).map_err(|e| format!("serializing DynamicObject: {}", e))?;
    if cfg!(feature = "strip-managed-fields") {
        strip_managed_fields(&mut raw);
    }
    TrackedObject::from_raw(raw).map_err(|e| e.to_string())
}

fn request_error(e: kube::Error) -> KviewError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => KviewError::NotFound(resp.message.clone()),
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => KviewError::Forbidden(resp.message.clone()),
        kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => KviewError::InvalidArgument(resp.message.clone()),
        _ => KviewError::Transport(e.to_string()),
    }
}

fn watch_error(e: watcher::Error) -> WatchError {
    match &e {
        watcher::Error::InitialListFailed(_) => WatchError::ListFailed(e.to_string()),
        _ => WatchError::Transport(e.to_string()),
    }
}

fn translate(ev: Event<DynamicObject>) -> Result<RawEvent, WatchError> {
    match ev {
        Event::Applied(o) => tracked(&o).map(RawEvent::Applied).map_err(WatchError::Decode),
        Event::Deleted(o) => tracked(&o).map(RawEvent::Deleted).map_err(WatchError::Decode),
        Event::Restarted(list) => {
            let items = list.iter().map(tracked).collect::<Result<Vec<_>, _>>().map_err(WatchError::Decode)?;
            Ok(RawEvent::Restarted(items))
        }
    }
}

/// `ResourceClient` backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Infer configuration (kubeconfig current context, or in-cluster).
    pub async fn try_default() -> KviewResult<Self> {
        let t0 = Instant::now();
        let client = Client::try_default().await.map_err(|e| KviewError::Config(e.to_string()))?;
        info!(took_ms = %t0.elapsed().as_millis(), "kube client ready");
        Ok(Self { client })
    }

    /// Check the API server answers before declaring the client usable.
    pub async fn probe(&self) -> KviewResult<()> {
        let info = self.client.apiserver_version().await.map_err(|e| KviewError::Config(e.to_string()))?;
        info!(server = %info.git_version, "api server reachable");
        Ok(())
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) if kind.namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn scoped_api(&self, kind: ResourceKind, namespace: Option<&str>) -> KviewResult<Api<DynamicObject>> {
        if kind.namespaced() && namespace.is_none() {
            return Err(KviewError::InvalidArgument(format!("namespace required for {}", kind)));
        }
        Ok(self.api(kind, namespace))
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> KviewResult<Vec<TrackedObject>> {
        let t0 = Instant::now();
        let list = self.api(kind, namespace).list(&ListParams::default()).await.map_err(request_error)?;
        let items = list
            .items
            .iter()
            .map(tracked)
            .collect::<Result<Vec<_>, _>>()
            .map_err(KviewError::Internal)?;
        debug!(kind = %kind, ns = ?namespace, items = items.len(), took_ms = %t0.elapsed().as_millis(), "list ok");
        Ok(items)
    }

    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> KviewResult<TrackedObject> {
        let obj = self.scoped_api(kind, namespace)?.get(name).await.map_err(request_error)?;
        tracked(&obj).map_err(KviewError::Internal)
    }

    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> KviewResult<Option<TrackedObject>> {
        let res = self
            .scoped_api(kind, namespace)?
            .delete(name, &DeleteParams::default())
            .await
            .map_err(request_error)?;
        info!(kind = %kind, ns = ?namespace, name = %name, "delete accepted");
        match res.left() {
            Some(obj) => tracked(&obj).map(Some).map_err(KviewError::Internal),
            None => Ok(None),
        }
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: serde_json::Value,
    ) -> KviewResult<TrackedObject> {
        let pp = PatchParams::default();
        let obj = self
            .scoped_api(kind, namespace)?
            .patch(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(request_error)?;
        info!(kind = %kind, ns = ?namespace, name = %name, "patch applied");
        tracked(&obj).map_err(KviewError::Internal)
    }

    fn watch(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<RawEventStream, WatchError> {
        let api = self.api(kind, namespace);
        let stream = watcher::watcher(api, watcher::Config::default())
            .map_err(watch_error)
            .map(|res| res.and_then(translate));
        info!(kind = %kind, path = %kind.collection_path(namespace), "list+watch opened");
        Ok(stream.boxed())
    }
}
