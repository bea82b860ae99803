//! Resource client seam: request/response calls plus the list+watch
//! capability a watch channel is built on.

use futures::stream::BoxStream;
use kview_core::{KviewError, KviewResult, ResourceKind, TrackedObject};

/// One notification from a list+watch stream, before it is translated into
/// added/modified/deleted changes.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Object created or updated.
    Applied(TrackedObject),
    /// Object removed.
    Deleted(TrackedObject),
    /// Full listing after a (re)connect; replaces everything seen so far.
    Restarted(Vec<TrackedObject>),
}

/// Failures surfaced by a watch stream.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("watch aborted")]
    Aborted,
    #[error("initial list failed: {0}")]
    ListFailed(String),
    #[error("watch stream failed: {0}")]
    Transport(String),
    #[error("malformed object: {0}")]
    Decode(String),
    #[error("watch could not be started: {0}")]
    StartFailed(String),
}

pub type RawEventStream = BoxStream<'static, Result<RawEvent, WatchError>>;

/// Authenticated handle to the cluster API. No retries happen at this layer.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> KviewResult<Vec<TrackedObject>>;

    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> KviewResult<TrackedObject>;

    /// Returns the object when the server reports it as still terminating.
    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> KviewResult<Option<TrackedObject>>;

    /// JSON merge patch.
    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: serde_json::Value,
    ) -> KviewResult<TrackedObject>;

    /// Open a list-then-watch stream for one collection. The stream retries
    /// internally after errors; it never ends on its own under normal operation.
    fn watch(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<RawEventStream, WatchError>;
}

/// Validate a requested replica count before anything goes over the wire.
pub fn validate_replicas(replicas: i64) -> KviewResult<i32> {
    if replicas < 0 {
        return Err(KviewError::InvalidArgument(format!("replicas must be non-negative (got {})", replicas)));
    }
    i32::try_from(replicas).map_err(|_| KviewError::InvalidArgument(format!("replicas out of range: {}", replicas)))
}

/// Scale a deployment by patching `.spec.replicas` only.
pub async fn scale_deployment(
    client: &dyn ResourceClient,
    namespace: &str,
    name: &str,
    replicas: i64,
) -> KviewResult<TrackedObject> {
    let replicas = validate_replicas(replicas)?;
    let payload = serde_json::json!({ "spec": { "replicas": replicas } });
    client.patch(ResourceKind::Deployment, Some(namespace), name, payload).await
}
