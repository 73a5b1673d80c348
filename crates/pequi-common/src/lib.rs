//! Pequi Common - Shared types and utilities
//!
//! This crate provides the foundational pieces used across all Pequi
//! components:
//! - Error types
//! - Peer credential signing
//! - Utility functions

pub mod crypto;
pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::PequiError;
pub use utils::{local_ip, now_millis};

/// Default port on which a node accepts peer connections
pub const DEFAULT_PEER_PORT: u16 = 4780;

/// Default node liveness window in milliseconds; a node whose record has not
/// been refreshed within this window is considered departed
pub const DEFAULT_STALE_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Default interval between node heartbeat ticks in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60 * 1000;

/// Delay before the first heartbeat tick in milliseconds
pub const DEFAULT_HEARTBEAT_DELAY_MS: u64 = 5 * 1000;
