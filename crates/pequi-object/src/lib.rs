//! Pequi Object - the distributed object substrate
//!
//! This crate provides:
//! - Distributed objects with registered field tables
//! - The object manager: one event loop per manager owning all of its
//!   objects, applying mutations strictly in order and fanning them out to
//!   listeners and remote subscribers
//! - Typed service invocation multiplexed over the event channel
//! - Mirror bootstrap for replicating remote objects locally

pub mod invocation;
pub mod manager;
pub mod object;

// Re-export commonly used types
pub use invocation::{
    CallKind, InvocationContext, InvocationError, InvocationFailure, InvocationProvider,
    InvocationRegistry, MethodDescriptor, PendingCall, ServiceDescriptor, ServiceStub,
};
pub use manager::{
    ListenerId, ManagerHandle, ObjectAccessError, ObjectManager, ObjectManagerConfig,
    SubscriberId, TransactionBuilder,
};
pub use object::{DObject, EventListener, FieldKind, FieldSpec, ObjectSpec};
