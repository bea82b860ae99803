//! kview bridge: marshals commands from the presentation side to the
//! privileged side and signals back.
//!
//! The two sides share nothing but a pair of byte channels; every frame is
//! JSON-encoded on the way through. `pair` builds both ends, `Backend::serve`
//! runs the privileged end and `BridgeClient` is what a front-end holds.

#![forbid(unsafe_code)]

use std::time::Duration;

use kview_kubehub::WatchConfig;
use tokio::sync::mpsc;
use tracing::warn;

mod backend;
mod client;
mod frame;

pub use backend::{Backend, ClusterConnector, KubeConnector, Session, StaticConnector};
pub use client::BridgeClient;
pub use frame::{decode, encode, Command, Frame, Reply};

/// Runtime configuration shared by both ends of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Capacity of every bounded channel (frames, signals, subscriptions).
    pub queue_cap: usize,
    pub request_timeout: Duration,
    pub watch: WatchConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { queue_cap: 2048, request_timeout: Duration::from_secs(30), watch: WatchConfig::default() }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queue_cap = match std::env::var("KVIEW_QUEUE_CAP") {
            Ok(s) => match s.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(value = %s, "invalid KVIEW_QUEUE_CAP; using default");
                    defaults.queue_cap
                }
            },
            Err(_) => defaults.queue_cap,
        };
        let request_timeout = match std::env::var("KVIEW_REQUEST_TIMEOUT_SECS") {
            Ok(s) => match s.parse::<u64>() {
                Ok(n) if n > 0 => Duration::from_secs(n),
                _ => {
                    warn!(value = %s, "invalid KVIEW_REQUEST_TIMEOUT_SECS; using default");
                    defaults.request_timeout
                }
            },
            Err(_) => defaults.request_timeout,
        };
        Self { queue_cap, request_timeout, watch: WatchConfig::from_env() }
    }
}

/// Privileged end of a bridge built by `pair`.
pub struct BackendEndpoint {
    pub(crate) inbound: mpsc::Receiver<Vec<u8>>,
    pub(crate) outbound: mpsc::Sender<Vec<u8>>,
}

/// Connect a client and a backend endpoint with bounded byte channels.
/// The client's reader task is spawned on the current runtime.
pub fn pair(config: &BridgeConfig) -> (BridgeClient, BackendEndpoint) {
    let (to_backend, inbound) = mpsc::channel(config.queue_cap);
    let (outbound, from_backend) = mpsc::channel(config.queue_cap);
    let client = BridgeClient::new(to_backend, from_backend, config);
    (client, BackendEndpoint { inbound, outbound })
}
