//! Pequi Peer - cluster coordination on top of the object substrate
//!
//! This crate provides:
//! - Node membership through a shared liveness store (heartbeat/lease)
//! - One published node object per peer, mirrored cluster-wide
//! - Cluster-wide resource locks ratified by the full current membership
//! - Location-transparent forwarding of service calls to specific peers
//! - Framed peer transports (TCP and in-process)

pub mod lock;
pub mod model;
pub mod net;
pub mod node_object;
pub mod peer;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use lock::{DroppedLock, LockKey, LockOutcome, LockState};
pub use model::{PeerEvent, PeerManagerConfig, PeerStats};
pub use net::{MemoryTransport, PeerConn, PeerTransport, TcpTransport};
pub use peer::PeerManager;
pub use store::{FileNodeStore, MemoryNodeStore, NodeStore};
