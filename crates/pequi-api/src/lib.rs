//! Pequi API - data model shared by the object substrate and the peer layer
//!
//! This crate provides:
//! - Object identifiers and keyed entry sets
//! - Event models (single mutations and compound batches) with transport hints
//! - Wire frames exchanged between peers
//! - Node records for the cluster liveness store

pub mod event;
pub mod model;
pub mod remote;

// Re-export commonly used types
pub use event::{DEvent, DeliveryClass, EventBody, Transport};
pub use model::{EntryKey, EntrySet, NodeRecord, Oid, SetEntry};
