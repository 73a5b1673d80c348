//! Peer manager configuration and cluster-facing model types

use std::time::Duration;

use pequi_common::{
    DEFAULT_HEARTBEAT_DELAY_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_PEER_PORT,
    DEFAULT_STALE_WINDOW_MS, local_ip,
};

/// Peer manager configuration
#[derive(Clone, Debug)]
pub struct PeerManagerConfig {
    /// Unique name of this node within the cluster
    pub node_name: String,
    /// Cluster-wide secret from which peer credentials are derived
    pub shared_secret: String,
    /// Host name peers in the same region connect to
    pub host_name: String,
    /// Host name peers in other regions connect to; defaults to `host_name`
    pub public_host_name: Option<String>,
    /// Region this node lives in
    pub region: Option<String>,
    /// Port on which this node accepts peer connections
    pub port: u16,
    /// Listen address override; defaults to `host_name:port`
    pub bind_address: Option<String>,
    /// Interval between heartbeat ticks
    pub heartbeat_interval: Duration,
    /// Delay before the first heartbeat tick
    pub heartbeat_delay: Duration,
    /// Liveness window: a record older than this marks a departed node
    pub stale_window: Duration,
}

impl PeerManagerConfig {
    pub fn new(node_name: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            shared_secret: shared_secret.into(),
            host_name: local_ip(),
            public_host_name: None,
            region: None,
            port: DEFAULT_PEER_PORT,
            bind_address: None,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_delay: Duration::from_millis(DEFAULT_HEARTBEAT_DELAY_MS),
            stale_window: Duration::from_millis(DEFAULT_STALE_WINDOW_MS),
        }
    }

    /// The address this node listens on for peer connections
    pub fn listen_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host_name, self.port))
    }

    pub fn stale_window_ms(&self) -> u64 {
        self.stale_window.as_millis() as u64
    }
}

/// Cluster membership change notifications
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer connection came up and its node object is mirrored
    Connected { node: String },
    /// A peer connection went away and its mirror was torn down
    Disconnected { node: String },
}

/// Runtime statistics tracked by the peer manager
#[derive(Clone, Debug, Default)]
pub struct PeerStats {
    /// Number of locks acquired by this node
    pub locks_acquired: u64,
    /// Number of locks released by this node
    pub locks_released: u64,
    /// Number of locks forcibly taken from or dropped by this node
    pub locks_hijacked: u64,
    /// Number of cross-node service requests issued
    pub node_requests: u64,
}
