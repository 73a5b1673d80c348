//! The node object
//!
//! Each peer publishes exactly one node object: its name and boot stamp,
//! the services it exposes to other peers, the sessions currently hosted on
//! it, and the set of resource locks it holds. Peers mirror each other's
//! node objects through the ordinary replication protocol, so cluster state
//! rides the same substrate as any other replicated entity.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use pequi_api::event::DEvent;
use pequi_api::model::{EntryKey, Oid, SetEntry};
use pequi_object::{ManagerHandle, ObjectSpec};

use crate::lock::LockKey;

/// Field name of the node's unique name
pub const NODE_NAME: &str = "nodeName";
/// Field name of the node's process start stamp
pub const BOOT_STAMP: &str = "bootStamp";
/// Field name of the exposed service list
pub const SERVICES: &str = "services";
/// Field name of the hosted-session entry set
pub const SESSIONS: &str = "sessions";
/// Field name of the held-lock entry set
pub const LOCKS: &str = "locks";
/// Field name broadcasting a node's intent to acquire a lock
pub const ACQUIRING_LOCK: &str = "acquiringLock";

/// The field table of a node object
pub fn node_object_spec() -> ObjectSpec {
    ObjectSpec::new("nodeObject")
        .attribute(NODE_NAME)
        .attribute(BOOT_STAMP)
        .attribute(SERVICES)
        .attribute(ACQUIRING_LOCK)
        .set(SESSIONS)
        .set(LOCKS)
}

/// One session hosted on a peer, keyed by its unique name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub name: String,
}

impl SessionInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl SetEntry for SessionInfo {
    fn entry_key(&self) -> EntryKey {
        EntryKey::Text(self.name.clone())
    }
}

/// Typed write surface over a node object.
///
/// Every method builds the matching mutation event and posts it; the field
/// changes when the event applies on the event loop, and replicates to every
/// mirroring peer from there.
#[derive(Clone)]
pub struct NodeObjectView {
    oid: Oid,
    handle: ManagerHandle,
}

impl NodeObjectView {
    pub fn new(oid: Oid, handle: ManagerHandle) -> Self {
        Self { oid, handle }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn set_node_name(&self, name: &str) {
        self.post_attribute(NODE_NAME, json!(name));
    }

    pub fn set_boot_stamp(&self, stamp: i64) {
        self.post_attribute(BOOT_STAMP, json!(stamp));
    }

    pub fn set_services(&self, services: &[String]) {
        self.post_attribute(SERVICES, json!(services));
    }

    /// Broadcasts this node's desire to acquire a lock
    pub fn set_acquiring_lock(&self, key: &LockKey) {
        self.post_attribute(ACQUIRING_LOCK, serde_json::to_value(key).unwrap_or(Value::Null));
    }

    pub fn clear_acquiring_lock(&self) {
        self.post_attribute(ACQUIRING_LOCK, Value::Null);
    }

    pub fn add_to_locks(&self, key: &LockKey) {
        self.handle.try_post_event(DEvent::entry_added(
            self.oid,
            LOCKS,
            key.entry_key(),
            serde_json::to_value(key).unwrap_or(Value::Null),
        ));
    }

    pub fn remove_from_locks(&self, key: &LockKey) {
        self.handle
            .try_post_event(DEvent::entry_removed(self.oid, LOCKS, key.entry_key()));
    }

    pub fn add_to_sessions(&self, session: &SessionInfo) {
        self.handle.try_post_event(DEvent::entry_added(
            self.oid,
            SESSIONS,
            session.entry_key(),
            session.to_value(),
        ));
    }

    pub fn remove_from_sessions(&self, name: &str) {
        self.handle.try_post_event(DEvent::entry_removed(
            self.oid,
            SESSIONS,
            EntryKey::Text(name.to_string()),
        ));
    }

    fn post_attribute(&self, name: &str, value: Value) {
        self.handle
            .try_post_event(DEvent::attribute_changed(self.oid, name, value));
    }
}

#[cfg(test)]
mod tests {
    use pequi_object::{ObjectManager, ObjectManagerConfig};

    use super::*;

    #[tokio::test]
    async fn test_node_object_view_writes() {
        let manager = ObjectManager::new(ObjectManagerConfig::default());
        let handle = manager.handle();
        let oid = handle.register_object(node_object_spec()).await.unwrap();
        let view = NodeObjectView::new(oid, handle.clone());

        view.set_node_name("alpha");
        view.set_boot_stamp(42);
        view.add_to_sessions(&SessionInfo::new("user-1"));
        let key = LockKey::new("door");
        view.set_acquiring_lock(&key);
        view.add_to_locks(&key);

        let snapshot = handle.snapshot(oid).await.unwrap();
        assert_eq!(snapshot.attributes[NODE_NAME], json!("alpha"));
        assert_eq!(snapshot.attributes[BOOT_STAMP], json!(42));
        assert_eq!(snapshot.sets[SESSIONS].len(), 1);
        assert!(snapshot.sets[LOCKS].contains_key(&key.entry_key()));

        view.remove_from_locks(&key);
        view.clear_acquiring_lock();
        view.remove_from_sessions("user-1");

        let snapshot = handle.snapshot(oid).await.unwrap();
        assert!(snapshot.sets[LOCKS].is_empty());
        assert!(snapshot.sets[SESSIONS].is_empty());
        assert_eq!(snapshot.attributes[ACQUIRING_LOCK], Value::Null);
    }
}
