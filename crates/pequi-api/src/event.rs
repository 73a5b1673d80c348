//! Event models
//!
//! An event is an immutable description of a single state mutation on one
//! distributed object, or a compound batch of them. Events carry a transport
//! hint selecting the delivery class used when forwarding to remote
//! subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{EntryKey, Oid};

/// Delivery class requested for an event or method call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryClass {
    /// Reliable, ordered per target; the default and the minimum the
    /// transport collaborator must provide
    #[default]
    ReliableOrdered,
    /// May be dropped under pressure; for less critical traffic only
    Unreliable,
}

/// Per-event transport hint: delivery class plus channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transport {
    pub class: DeliveryClass,
    pub channel: u8,
}

impl Transport {
    pub const DEFAULT: Transport = Transport {
        class: DeliveryClass::ReliableOrdered,
        channel: 0,
    };

    pub fn unreliable(channel: u8) -> Self {
        Transport {
            class: DeliveryClass::Unreliable,
            channel,
        }
    }

    /// Combines two hints into the one strong enough for both
    pub fn combine(self, other: Transport) -> Transport {
        if self.class == DeliveryClass::ReliableOrdered
            || other.class == DeliveryClass::ReliableOrdered
        {
            Transport {
                class: DeliveryClass::ReliableOrdered,
                channel: self.channel.min(other.channel),
            }
        } else {
            Transport {
                class: DeliveryClass::Unreliable,
                channel: self.channel.min(other.channel),
            }
        }
    }
}

/// Reserved invocation method id carrying a failure reason back to a caller
pub const REQUEST_FAILED_METHOD: u16 = 0;

/// One state mutation, or a compound batch of them
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventBody {
    /// A named attribute took a new value
    #[serde(rename_all = "camelCase")]
    AttributeChanged { name: String, value: Value },

    /// An entry was added to a named entry set
    #[serde(rename_all = "camelCase")]
    EntryAdded {
        name: String,
        key: EntryKey,
        entry: Value,
    },

    /// The entry with the given key was removed from a named entry set
    #[serde(rename_all = "camelCase")]
    EntryRemoved { name: String, key: EntryKey },

    /// The entry with the given key was replaced in a named entry set
    #[serde(rename_all = "camelCase")]
    EntryUpdated {
        name: String,
        key: EntryKey,
        entry: Value,
    },

    /// A broadcast notification; applies no state
    #[serde(rename_all = "camelCase")]
    Message { name: String, args: Vec<Value> },

    /// A typed service request multiplexed over the event channel
    #[serde(rename_all = "camelCase")]
    InvocationRequest {
        service: String,
        method_id: u16,
        request_id: u64,
        args: Vec<Value>,
    },

    /// The response correlated to an earlier request by its request id
    #[serde(rename_all = "camelCase")]
    InvocationResponse {
        request_id: u64,
        method_id: u16,
        args: Vec<Value>,
    },

    /// A transactional batch applied and observed atomically
    #[serde(rename_all = "camelCase")]
    Compound { events: Vec<EventBody> },
}

impl EventBody {
    /// The field name this mutation touches, if any
    pub fn field_name(&self) -> Option<&str> {
        match self {
            EventBody::AttributeChanged { name, .. }
            | EventBody::EntryAdded { name, .. }
            | EventBody::EntryRemoved { name, .. }
            | EventBody::EntryUpdated { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// An event targeting one distributed object, immutable once built
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DEvent {
    pub target: Oid,
    pub body: EventBody,
    #[serde(default)]
    pub transport: Transport,
}

impl DEvent {
    pub fn new(target: Oid, body: EventBody) -> Self {
        Self {
            target,
            body,
            transport: Transport::DEFAULT,
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn attribute_changed(target: Oid, name: impl Into<String>, value: Value) -> Self {
        Self::new(
            target,
            EventBody::AttributeChanged {
                name: name.into(),
                value,
            },
        )
    }

    pub fn entry_added(target: Oid, name: impl Into<String>, key: EntryKey, entry: Value) -> Self {
        Self::new(
            target,
            EventBody::EntryAdded {
                name: name.into(),
                key,
                entry,
            },
        )
    }

    pub fn entry_removed(target: Oid, name: impl Into<String>, key: EntryKey) -> Self {
        Self::new(
            target,
            EventBody::EntryRemoved {
                name: name.into(),
                key,
            },
        )
    }

    pub fn entry_updated(
        target: Oid,
        name: impl Into<String>,
        key: EntryKey,
        entry: Value,
    ) -> Self {
        Self::new(
            target,
            EventBody::EntryUpdated {
                name: name.into(),
                key,
                entry,
            },
        )
    }

    pub fn message(target: Oid, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(
            target,
            EventBody::Message {
                name: name.into(),
                args,
            },
        )
    }

    /// Builds a compound event; the combined transport hint is the strongest
    /// among the batched events
    pub fn compound(target: Oid, events: Vec<EventBody>) -> Self {
        Self::new(target, EventBody::Compound { events })
    }
}
