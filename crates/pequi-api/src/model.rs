//! Core model types: object identifiers, keyed entry sets, node records

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of one distributed object within a manager's lifetime.
///
/// Allocated monotonically by the owning manager and never reused, so a
/// stale oid fails lookup cleanly instead of resolving to another object.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Oid(pub u32);

impl Display for Oid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unique, comparable key of one entry in an [`EntrySet`]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryKey {
    Int(i64),
    Text(String),
}

impl Display for EntryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKey::Int(v) => write!(f, "{}", v),
            EntryKey::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for EntryKey {
    fn from(v: i64) -> Self {
        EntryKey::Int(v)
    }
}

impl From<&str> for EntryKey {
    fn from(v: &str) -> Self {
        EntryKey::Text(v.to_string())
    }
}

impl From<String> for EntryKey {
    fn from(v: String) -> Self {
        EntryKey::Text(v)
    }
}

/// Typed values that can live in an entry set
///
/// An implementation provides its key and serializes into the stored JSON
/// representation.
pub trait SetEntry: Serialize {
    /// The key identifying this entry within its set
    fn entry_key(&self) -> EntryKey;

    /// The stored representation of this entry
    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A keyed set of values replicated as one distributed-object field.
///
/// No two live entries ever share a key. Adding an existing key and removing
/// an absent key are idempotent signals, not errors; updating an absent key
/// is refused. Iteration order is unspecified and must not be relied upon.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntrySet {
    entries: BTreeMap<EntryKey, Value>,
}

impl EntrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry under the given key.
    ///
    /// Returns `true` if an entry with that key already existed, in which
    /// case the set is left unchanged.
    pub fn add(&mut self, key: EntryKey, entry: Value) -> bool {
        if self.entries.contains_key(&key) {
            return true;
        }
        self.entries.insert(key, entry);
        false
    }

    /// Adds a typed entry, deriving the key from the entry itself
    pub fn add_entry<E: SetEntry>(&mut self, entry: &E) -> bool {
        self.add(entry.entry_key(), entry.to_value())
    }

    /// Removes the entry with the given key.
    ///
    /// Returns the removed entry, or `None` when nothing was present.
    pub fn remove(&mut self, key: &EntryKey) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Replaces the entry with the given key.
    ///
    /// Returns the old entry, or `None` when the key was absent, in which
    /// case nothing is updated (callers must check membership first).
    pub fn update(&mut self, key: EntryKey, entry: Value) -> Option<Value> {
        if !self.entries.contains_key(&key) {
            return None;
        }
        self.entries.insert(key, entry)
    }

    pub fn get(&self, key: &EntryKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntryKey, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntryKey> {
        self.entries.keys()
    }

    /// Deserializes each entry into the given type, skipping entries that do
    /// not parse
    pub fn typed<E: for<'a> Deserialize<'a>>(&self) -> Vec<E> {
        self.entries
            .values()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }
}

// Entry sets cross the wire as an array of key/value items; JSON objects
// cannot carry non-string map keys.
#[derive(Serialize, Deserialize)]
struct SetItem {
    key: EntryKey,
    value: Value,
}

impl Serialize for EntrySet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.entries.iter().map(|(key, value)| SetItem {
            key: key.clone(),
            value: value.clone(),
        }))
    }
}

impl<'de> Deserialize<'de> for EntrySet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let items = Vec::<SetItem>::deserialize(deserializer)?;
        let mut set = EntrySet::new();
        for item in items {
            set.entries.insert(item.key, item.value);
        }
        Ok(set)
    }
}

/// Information on an active node in a Pequi cluster.
///
/// Created and refreshed by its owning peer on every heartbeat tick, read by
/// every peer at connect time and on periodic refresh.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// The unique name assigned to this node
    pub node_name: String,

    /// The DNS name used to connect to this node by other peers
    pub host_name: String,

    /// The DNS name used to connect to this node from outside its region
    pub public_host_name: String,

    /// The region in which the node exists; nodes in different regions
    /// connect through the public host name
    pub region: Option<String>,

    /// The port on which to connect to this node
    pub port: u16,

    /// The last time this node reported in, millis since the epoch
    pub last_updated: i64,

    /// Whether this node has explicitly shut down
    pub shutdown: bool,
}

impl NodeRecord {
    pub fn new(
        node_name: impl Into<String>,
        host_name: impl Into<String>,
        public_host_name: Option<String>,
        region: Option<String>,
        port: u16,
    ) -> Self {
        let host_name = host_name.into();
        let public_host_name = public_host_name.unwrap_or_else(|| host_name.clone());
        Self {
            node_name: node_name.into(),
            host_name,
            public_host_name,
            region,
            port,
            last_updated: pequi_common::now_millis(),
            shutdown: false,
        }
    }

    /// A node is live iff it has reported in within the window and has not
    /// explicitly shut down
    pub fn is_live(&self, now: i64, window_ms: u64) -> bool {
        !self.shutdown && now - self.last_updated <= window_ms as i64
    }

    /// The host name peers in the given region should connect to
    pub fn peer_host_name(&self, region: Option<&str>) -> &str {
        if self.region.as_deref() == region {
            &self.host_name
        } else {
            &self.public_host_name
        }
    }

    /// The connect address for peers in the given region
    pub fn peer_address(&self, region: Option<&str>) -> String {
        format!("{}:{}", self.peer_host_name(region), self.port)
    }
}
