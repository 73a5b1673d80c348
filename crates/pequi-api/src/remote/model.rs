//! Frames exchanged between peers
//!
//! A peer connection is a framed duplex pipe. The connecting side opens with
//! `Auth`; after a successful handshake either side may subscribe to the
//! other's objects, receive the resulting ordered event stream, and issue
//! service requests correlated by request id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{EntrySet, Oid};
use crate::event::DEvent;

/// Credential presented by a connecting peer: the node name plus the
/// hex-encoded keyed hash of it under the cluster shared secret
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCredentials {
    pub node_name: String,
    pub signature: String,
}

impl PeerCredentials {
    /// Mints credentials for a node using the cluster shared secret
    pub fn sign(
        shared_secret: &str,
        node_name: impl Into<String>,
    ) -> Result<Self, pequi_common::crypto::CredentialError> {
        let node_name = node_name.into();
        let signature = pequi_common::crypto::sign_node_name(shared_secret, &node_name)?;
        Ok(Self {
            node_name,
            signature,
        })
    }

    /// Validates these credentials against the cluster shared secret
    pub fn are_valid(&self, shared_secret: &str) -> bool {
        pequi_common::crypto::verify_node_name(shared_secret, &self.node_name, &self.signature)
    }
}

/// Full state of one distributed object, used to bootstrap a mirror
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSnapshot {
    pub oid: Oid,
    pub class: String,
    pub attributes: BTreeMap<String, Value>,
    pub sets: BTreeMap<String, EntrySet>,
}

/// One frame on a peer connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum Frame {
    /// Opening handshake from the connecting side
    #[serde(rename_all = "camelCase")]
    Auth { credentials: PeerCredentials },

    /// Handshake accepted; authentication is mutual, so the acceptor
    /// presents its own credentials along with the oid of its node object
    #[serde(rename_all = "camelCase")]
    AuthOk {
        credentials: PeerCredentials,
        node_oid: Oid,
    },

    /// Handshake refused; the connection is closed afterwards
    #[serde(rename_all = "camelCase")]
    AuthFailed { reason: String },

    /// Request a snapshot plus the subsequent event stream for an object
    #[serde(rename_all = "camelCase")]
    Subscribe { oid: Oid },

    #[serde(rename_all = "camelCase")]
    SubscribeOk { snapshot: ObjectSnapshot },

    /// Subscription refused; surfaced only to the requester
    #[serde(rename_all = "camelCase")]
    SubscribeFailed { oid: Oid, reason: String },

    /// Stop forwarding events for an object
    #[serde(rename_all = "camelCase")]
    Unsubscribe { oid: Oid },

    /// One replicated event, forwarded in exact application order per oid
    #[serde(rename_all = "camelCase")]
    Event { event: DEvent },

    /// A service invocation on the receiving peer
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: u64,
        service: String,
        method_id: u16,
        args: Vec<Value>,
    },

    /// The response correlated to an earlier request; method id 0 carries a
    /// failure reason in the first argument
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: u64,
        method_id: u16,
        args: Vec<Value>,
    },

    /// Orderly goodbye; the sender will close the connection
    Bye,
}
