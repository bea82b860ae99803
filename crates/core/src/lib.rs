//! kview core types shared by the privileged (cluster) side and the
//! presentation side of the bridge.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod error;

pub use error::{KviewError, KviewResult, ObjectError};

/// Object identifier as assigned by the API server (`metadata.uid`).
pub type Uid = String;

/// Resource kinds the watch subsystem knows how to track.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Pod,
    Service,
    Deployment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Namespace,
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::Deployment,
    ];

    /// API group; empty for the core group.
    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "apps",
            _ => "",
        }
    }

    pub fn version(&self) -> &'static str { "v1" }

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespaces",
            ResourceKind::Pod => "pods",
            ResourceKind::Service => "services",
            ResourceKind::Deployment => "deployments",
        }
    }

    pub fn namespaced(&self) -> bool { !matches!(self, ResourceKind::Namespace) }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::Deployment => "Deployment",
        }
    }

    /// REST collection path, e.g. `/api/v1/namespaces/default/pods` or
    /// `/apis/apps/v1/deployments` when no namespace is given.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        let prefix = if self.group().is_empty() {
            format!("/api/{}", self.version())
        } else {
            format!("/apis/{}/{}", self.group(), self.version())
        };
        match namespace {
            Some(ns) if self.namespaced() => format!("{}/namespaces/{}/{}", prefix, ns, self.plural()),
            _ => format!("{}/{}", prefix, self.plural()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ResourceKind {
    type Err = KviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "namespace" | "namespaces" | "ns" => Ok(ResourceKind::Namespace),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            other => Err(KviewError::InvalidArgument(format!("unknown resource kind: {}", other))),
        }
    }
}

/// An object as last reported by the API server. Replaced wholesale on
/// every update; never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedObject {
    pub uid: Uid,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    pub creation_ts: i64,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Full object as received (spec/status payload included).
    pub raw: serde_json::Value,
}

impl TrackedObject {
    /// Decode the identifying metadata of a raw API object.
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, ObjectError> {
        let meta = raw.get("metadata").and_then(|m| m.as_object()).ok_or(ObjectError::MissingMetadata)?;
        let uid = meta
            .get("uid")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ObjectError::MissingField("uid"))?
            .to_string();
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or(ObjectError::MissingField("name"))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        let creation_ts = meta
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels = SmallVec::new();
        if let Some(lbls) = meta.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() { labels.push((k.clone(), val.to_string())); }
            }
        }
        Ok(Self { uid, namespace, name, resource_version, creation_ts, labels, raw })
    }

    pub fn spec(&self) -> Option<&serde_json::Value> { self.raw.get("spec") }

    pub fn status(&self) -> Option<&serde_json::Value> { self.raw.get("status") }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One change notification for one object of one kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub kind: ResourceKind,
    pub change_type: ChangeType,
    pub object: TrackedObject,
}

/// User-facing error notification emitted by a watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorNotice {
    pub kind: Option<ResourceKind>,
    pub message: String,
}

/// Signals flowing from the cluster side to the presentation side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    ObjectChanged(ChangeEvent),
    Connected { kind: ResourceKind },
    Error(ErrorNotice),
}

/// Lifecycle of a single watch subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatcherState {
    Unstarted,
    Starting,
    Connected,
    Error,
    Stopping,
    Stopped,
}

impl WatcherState {
    /// True while the subscription may still deliver events.
    pub fn is_live(&self) -> bool {
        matches!(self, WatcherState::Starting | WatcherState::Connected | WatcherState::Error | WatcherState::Stopping)
    }
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ChangeType, ErrorNotice, KviewError, KviewResult, ResourceKind, Signal, TrackedObject, Uid,
        WatcherState,
    };
}
