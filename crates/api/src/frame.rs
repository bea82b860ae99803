//! Wire frames crossing the bridge. Every frame is one JSON document.

use kview_core::{KviewError, KviewResult, ResourceKind, Signal, TrackedObject};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands issued by the presentation side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Initialize,
    RegisterWatcher { kind: ResourceKind, namespace: Option<String> },
    ListNamespaces,
    ListWatched { kind: ResourceKind },
    DeleteObject { kind: ResourceKind, namespace: Option<String>, name: String },
    ScaleDeployment { namespace: String, name: String, replicas: i64 },
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize => "initialize",
            Command::RegisterWatcher { .. } => "register_watcher",
            Command::ListNamespaces => "list_namespaces",
            Command::ListWatched { .. } => "list_watched",
            Command::DeleteObject { .. } => "delete_object",
            Command::ScaleDeployment { .. } => "scale_deployment",
            Command::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Initialized(bool),
    /// Command taken; its effects arrive later as signals.
    Accepted,
    Objects(Vec<TrackedObject>),
    Deleted(Option<TrackedObject>),
    Scaled(bool),
    Failed(KviewError),
}

impl Reply {
    /// Turn a reply that isn't the expected variant into an error.
    pub(crate) fn into_error(self, command: &'static str) -> KviewError {
        match self {
            Reply::Failed(e) => e,
            other => KviewError::Internal(format!("unexpected reply to {}: {:?}", command, other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request { id: Uuid, command: Command },
    Response { id: Uuid, reply: Reply },
    Signal { signal: Signal },
}

pub fn encode(frame: &Frame) -> KviewResult<Vec<u8>> {
    serde_json::to_vec(frame).map_err(|e| KviewError::Internal(format!("encode frame: {}", e)))
}

pub fn decode(bytes: &[u8]) -> KviewResult<Frame> {
    serde_json::from_slice(bytes).map_err(|e| KviewError::InvalidArgument(format!("decode frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let id = Uuid::nil();
        let frame = Frame::Request {
            id,
            command: Command::RegisterWatcher { kind: ResourceKind::Pod, namespace: Some("default".into()) },
        };
        let v: serde_json::Value = serde_json::from_slice(&encode(&frame).unwrap()).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "frame": "request",
                "id": "00000000-0000-0000-0000-000000000000",
                "command": { "cmd": "register_watcher", "kind": "Pod", "namespace": "default" }
            })
        );
    }

    #[test]
    fn failed_reply_carries_structured_error() {
        let frame = Frame::Response { id: Uuid::nil(), reply: Reply::Failed(KviewError::NotFound("pod x".into())) };
        let back = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(back, frame);
        match back {
            Frame::Response { reply, .. } => assert_eq!(reply.into_error("delete_object"), KviewError::NotFound("pod x".into())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode(b"{\"frame\":\"nope\"}"), Err(KviewError::InvalidArgument(_))));
    }
}
