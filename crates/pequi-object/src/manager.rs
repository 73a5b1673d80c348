//! The object manager
//!
//! One dedicated task per manager (the event loop) owns every object
//! registered with it and is the only code that mutates them. Everything
//! else talks to the loop through a bounded queue: events, registrations,
//! subscriptions, and closures to run in loop context. For a single target
//! oid every observer sees events in exactly dispatch order; across oids
//! there is no cross-ordering guarantee.
//!
//! Back-pressure is the only throttle. The inbound queue is bounded (the
//! async posting path waits for space, the synchronous path drops with a
//! warning), and each subscriber's outbound queue is bounded too: a full
//! subscriber queue ejects that subscriber rather than growing without
//! bound, except for unreliable-class events which are simply skipped.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use pequi_api::event::{DEvent, DeliveryClass, EventBody, Transport};
use pequi_api::model::{EntryKey, Oid};
use pequi_api::remote::ObjectSnapshot;

use crate::object::{DObject, EventListener, ObjectSpec};

/// Identifies one registered listener on one object
pub type ListenerId = u64;

/// Identifies one remote subscriber of one object
pub type SubscriberId = u64;

/// Decides whether a named requester may subscribe to an object
pub type AccessController = Box<dyn Fn(&str) -> bool + Send>;

/// Object-access failures, surfaced only to the requester
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectAccessError {
    #[error("no such object: {0}")]
    NotFound(Oid),

    #[error("access denied to object {0}")]
    AccessDenied(Oid),

    #[error("object manager is closed")]
    ManagerClosed,
}

/// Object manager configuration
#[derive(Clone, Debug)]
pub struct ObjectManagerConfig {
    /// Name used in logs
    pub name: String,
    /// Bound of the inbound event queue
    pub queue_size: usize,
    /// Bound of each remote subscriber's outbound queue
    pub subscriber_queue_size: usize,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            queue_size: 1024,
            subscriber_queue_size: 256,
        }
    }
}

enum Unit {
    /// An event from a local producer; forwarded upstream when the target is
    /// a proxied mirror
    Event(DEvent),
    /// An event arriving from the authoritative side of a mirror; always
    /// applied
    RemoteEvent(DEvent),
    Register {
        spec: ObjectSpec,
        access: Option<AccessController>,
        reply: oneshot::Sender<Oid>,
    },
    RegisterMirror {
        snapshot: ObjectSnapshot,
        upstream: Option<mpsc::Sender<DEvent>>,
        reply: oneshot::Sender<Oid>,
    },
    Destroy {
        oid: Oid,
    },
    AddListener {
        oid: Oid,
        listener: Box<dyn EventListener>,
        reply: oneshot::Sender<Result<ListenerId, ObjectAccessError>>,
    },
    RemoveListener {
        oid: Oid,
        listener: ListenerId,
    },
    Subscribe {
        oid: Oid,
        who: String,
        sender: mpsc::Sender<DEvent>,
        reply: oneshot::Sender<Result<(SubscriberId, ObjectSnapshot), ObjectAccessError>>,
    },
    Unsubscribe {
        oid: Oid,
        subscriber: SubscriberId,
    },
    Inspect {
        oid: Oid,
        f: Box<dyn FnOnce(Option<&DObject>) + Send>,
    },
    Task(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Routing information for a mirror of a remotely-owned object
struct ProxyRoute {
    remote_oid: Oid,
    upstream: mpsc::Sender<DEvent>,
}

struct ObjectSlot {
    object: DObject,
    access: Option<AccessController>,
    proxy: Option<ProxyRoute>,
    listeners: Vec<(ListenerId, Box<dyn EventListener>)>,
    next_listener_id: ListenerId,
    subscribers: Vec<(SubscriberId, mpsc::Sender<DEvent>)>,
    next_subscriber_id: SubscriberId,
}

impl ObjectSlot {
    fn new(object: DObject, access: Option<AccessController>, proxy: Option<ProxyRoute>) -> Self {
        Self {
            object,
            access,
            proxy,
            listeners: Vec::new(),
            next_listener_id: 1,
            subscribers: Vec::new(),
            next_subscriber_id: 1,
        }
    }
}

struct ManagerCore {
    name: Arc<str>,
    objects: HashMap<Oid, ObjectSlot>,
    next_oid: u32,
}

impl ManagerCore {
    fn allocate_oid(&mut self) -> Oid {
        let oid = Oid(self.next_oid);
        self.next_oid += 1;
        oid
    }

    fn register(&mut self, spec: ObjectSpec, access: Option<AccessController>) -> Oid {
        let oid = self.allocate_oid();
        let object = DObject::new(oid, spec);
        debug!(manager = %self.name, oid = %oid, class = object.class_name(), "registered object");
        self.objects.insert(oid, ObjectSlot::new(object, access, None));
        oid
    }

    fn register_mirror(
        &mut self,
        snapshot: ObjectSnapshot,
        upstream: Option<mpsc::Sender<DEvent>>,
    ) -> Oid {
        let oid = self.allocate_oid();
        let remote_oid = snapshot.oid;
        let object = DObject::from_snapshot(oid, snapshot);
        debug!(
            manager = %self.name, oid = %oid, remote_oid = %remote_oid,
            class = object.class_name(), "registered mirror"
        );
        let proxy = upstream.map(|upstream| ProxyRoute {
            remote_oid,
            upstream,
        });
        self.objects.insert(oid, ObjectSlot::new(object, None, proxy));
        oid
    }

    fn destroy(&mut self, oid: Oid) {
        if self.objects.remove(&oid).is_some() {
            debug!(manager = %self.name, oid = %oid, "destroyed object");
        } else {
            warn!(manager = %self.name, oid = %oid, "requested to destroy unknown object");
        }
    }

    fn subscribe(
        &mut self,
        oid: Oid,
        who: &str,
        sender: mpsc::Sender<DEvent>,
    ) -> Result<(SubscriberId, ObjectSnapshot), ObjectAccessError> {
        let Some(slot) = self.objects.get_mut(&oid) else {
            return Err(ObjectAccessError::NotFound(oid));
        };
        if let Some(access) = &slot.access
            && !access(who)
        {
            return Err(ObjectAccessError::AccessDenied(oid));
        }
        let id = slot.next_subscriber_id;
        slot.next_subscriber_id += 1;
        slot.subscribers.push((id, sender));
        debug!(manager = %self.name, oid = %oid, who = %who, "subscriber attached");
        Ok((id, slot.object.snapshot()))
    }

    fn process_event(&mut self, event: DEvent, from_remote: bool) {
        let name = self.name.clone();
        let Some(slot) = self.objects.get_mut(&event.target) else {
            warn!(manager = %name, target = %event.target, "dropping event for unknown object");
            return;
        };

        // local mutation requests against a mirror are routed to the
        // authoritative manager, with the target rewritten into its oid
        // space; the mirror itself only changes when the event comes back
        if !from_remote && let Some(proxy) = &slot.proxy {
            let mut forwarded = event;
            forwarded.target = proxy.remote_oid;
            if let Err(e) = proxy.upstream.try_send(forwarded) {
                warn!(manager = %name, error = %e, "failed to forward event upstream");
            }
            return;
        }

        if let Err(e) = slot.object.apply(&event.body) {
            warn!(
                manager = %name, target = %event.target, error = %e,
                "event failed to apply"
            );
            return;
        }

        // notify listeners in registration order; a compound batch is one
        // notification carrying all of its sub-mutations
        let mut listeners = std::mem::take(&mut slot.listeners);
        for (_, listener) in listeners.iter_mut() {
            listener.event_applied(&slot.object, &event);
        }
        slot.listeners = listeners;

        // hand the event to every remote subscriber of this oid, in
        // application order
        slot.subscribers.retain(|(id, sender)| {
            match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if event.transport.class == DeliveryClass::Unreliable {
                        // droppable traffic: skip the event, keep the subscriber
                        true
                    } else {
                        warn!(
                            manager = %name, target = %event.target, subscriber = id,
                            "subscriber queue full, ejecting"
                        );
                        false
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

async fn run(mut core: ManagerCore, mut rx: mpsc::Receiver<Unit>) {
    info!(manager = %core.name, "object manager started");
    while let Some(unit) = rx.recv().await {
        match unit {
            Unit::Event(event) => core.process_event(event, false),
            Unit::RemoteEvent(event) => core.process_event(event, true),
            Unit::Register { spec, access, reply } => {
                let _ = reply.send(core.register(spec, access));
            }
            Unit::RegisterMirror {
                snapshot,
                upstream,
                reply,
            } => {
                let _ = reply.send(core.register_mirror(snapshot, upstream));
            }
            Unit::Destroy { oid } => core.destroy(oid),
            Unit::AddListener { oid, listener, reply } => {
                let result = match core.objects.get_mut(&oid) {
                    Some(slot) => {
                        let id = slot.next_listener_id;
                        slot.next_listener_id += 1;
                        slot.listeners.push((id, listener));
                        Ok(id)
                    }
                    None => Err(ObjectAccessError::NotFound(oid)),
                };
                let _ = reply.send(result);
            }
            Unit::RemoveListener { oid, listener } => {
                if let Some(slot) = core.objects.get_mut(&oid) {
                    slot.listeners.retain(|(id, _)| *id != listener);
                }
            }
            Unit::Subscribe {
                oid,
                who,
                sender,
                reply,
            } => {
                let _ = reply.send(core.subscribe(oid, &who, sender));
            }
            Unit::Unsubscribe { oid, subscriber } => {
                if let Some(slot) = core.objects.get_mut(&oid) {
                    slot.subscribers.retain(|(id, _)| *id != subscriber);
                }
            }
            Unit::Inspect { oid, f } => f(core.objects.get(&oid).map(|s| &s.object)),
            Unit::Task(f) => f(),
            Unit::Shutdown => break,
        }
    }
    info!(manager = %core.name, "object manager stopped");
}

/// Thread-safe handle onto one object manager's event loop
#[derive(Clone)]
pub struct ManagerHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Unit>,
    subscriber_queue_size: usize,
}

impl ManagerHandle {
    /// Name of the manager this handle belongs to
    pub fn manager_name(&self) -> &str {
        &self.name
    }

    /// Bound applied to subscriber queues created by [`Self::subscriber_channel`]
    pub fn subscriber_queue_size(&self) -> usize {
        self.subscriber_queue_size
    }

    /// A channel pair sized for use as a subscriber queue
    pub fn subscriber_channel(&self) -> (mpsc::Sender<DEvent>, mpsc::Receiver<DEvent>) {
        mpsc::channel(self.subscriber_queue_size)
    }

    async fn send(&self, unit: Unit) -> Result<(), ObjectAccessError> {
        self.tx
            .send(unit)
            .await
            .map_err(|_| ObjectAccessError::ManagerClosed)
    }

    /// Enqueues an event for application; waits when the queue is full.
    ///
    /// There is no synchronous error path: once enqueued, application is
    /// unconditional, and a closed manager only logs.
    pub async fn post_event(&self, event: DEvent) {
        if self.send(Unit::Event(event)).await.is_err() {
            warn!(manager = %self.name, "posting event to closed object manager");
        }
    }

    /// Enqueues an event without waiting; drops it with a warning when the
    /// queue is full. Safe to call from loop context.
    pub fn try_post_event(&self, event: DEvent) {
        match self.tx.try_send(Unit::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(manager = %self.name, "event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(manager = %self.name, "posting event to closed object manager");
            }
        }
    }

    /// Enqueues an event arriving from the authoritative side of a mirror;
    /// the target must already be rewritten to the local mirror oid
    pub fn post_remote_event(&self, local_oid: Oid, mut event: DEvent) {
        event.target = local_oid;
        match self.tx.try_send(Unit::RemoteEvent(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(manager = %self.name, oid = %local_oid, "event queue full, dropping replicated event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Registers a new object and returns its oid
    pub async fn register_object(&self, spec: ObjectSpec) -> Result<Oid, ObjectAccessError> {
        self.register_inner(spec, None).await
    }

    /// Registers a new object guarded by an access controller consulted on
    /// every subscribe
    pub async fn register_object_with_access(
        &self,
        spec: ObjectSpec,
        access: AccessController,
    ) -> Result<Oid, ObjectAccessError> {
        self.register_inner(spec, Some(access)).await
    }

    async fn register_inner(
        &self,
        spec: ObjectSpec,
        access: Option<AccessController>,
    ) -> Result<Oid, ObjectAccessError> {
        let (reply, rx) = oneshot::channel();
        self.send(Unit::Register { spec, access, reply }).await?;
        rx.await.map_err(|_| ObjectAccessError::ManagerClosed)
    }

    /// Instantiates a local mirror from a snapshot of a remote object.
    ///
    /// When `upstream` is given, locally-posted mutation requests against
    /// the mirror are forwarded there (rewritten into the remote oid space)
    /// instead of applying; only replicated events change the mirror.
    pub async fn register_mirror(
        &self,
        snapshot: ObjectSnapshot,
        upstream: Option<mpsc::Sender<DEvent>>,
    ) -> Result<Oid, ObjectAccessError> {
        let (reply, rx) = oneshot::channel();
        self.send(Unit::RegisterMirror {
            snapshot,
            upstream,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ObjectAccessError::ManagerClosed)
    }

    /// Destroys an object; later lookups of the oid fail cleanly
    pub async fn destroy_object(&self, oid: Oid) {
        let _ = self.send(Unit::Destroy { oid }).await;
    }

    /// Builds and posts an attribute-change event for the calling object
    pub async fn request_attribute_change(&self, oid: Oid, name: &str, value: Value) {
        self.post_event(DEvent::attribute_changed(oid, name, value))
            .await;
    }

    /// Builds and posts an entry-add event
    pub async fn request_entry_add(&self, oid: Oid, name: &str, key: EntryKey, entry: Value) {
        self.post_event(DEvent::entry_added(oid, name, key, entry))
            .await;
    }

    /// Builds and posts an entry-remove event
    pub async fn request_entry_remove(&self, oid: Oid, name: &str, key: EntryKey) {
        self.post_event(DEvent::entry_removed(oid, name, key)).await;
    }

    /// Builds and posts an entry-update event
    pub async fn request_entry_update(&self, oid: Oid, name: &str, key: EntryKey, entry: Value) {
        self.post_event(DEvent::entry_updated(oid, name, key, entry))
            .await;
    }

    /// Opens a transaction accumulating requests into one compound event
    pub fn transaction(&self, oid: Oid) -> TransactionBuilder {
        TransactionBuilder {
            handle: self.clone(),
            target: oid,
            events: Vec::new(),
            transport: Transport::DEFAULT,
            committed: false,
        }
    }

    /// Registers a listener called after every event applied to the object
    pub async fn add_listener(
        &self,
        oid: Oid,
        listener: impl EventListener + 'static,
    ) -> Result<ListenerId, ObjectAccessError> {
        let (reply, rx) = oneshot::channel();
        self.send(Unit::AddListener {
            oid,
            listener: Box::new(listener),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ObjectAccessError::ManagerClosed)?
    }

    pub async fn remove_listener(&self, oid: Oid, listener: ListenerId) {
        let _ = self.send(Unit::RemoveListener { oid, listener }).await;
    }

    /// Attaches a remote subscriber: returns the bootstrap snapshot, then
    /// every subsequent event for the oid arrives on `sender` in exact
    /// application order
    pub async fn subscribe(
        &self,
        oid: Oid,
        who: impl Into<String>,
        sender: mpsc::Sender<DEvent>,
    ) -> Result<(SubscriberId, ObjectSnapshot), ObjectAccessError> {
        let (reply, rx) = oneshot::channel();
        self.send(Unit::Subscribe {
            oid,
            who: who.into(),
            sender,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ObjectAccessError::ManagerClosed)?
    }

    /// Stops forwarding to a subscriber, with no guarantee about
    /// drained-but-unsent events
    pub async fn unsubscribe(&self, oid: Oid, subscriber: SubscriberId) {
        let _ = self.send(Unit::Unsubscribe { oid, subscriber }).await;
    }

    /// Runs a closure against an object's current state on the event loop
    pub async fn with_object<R, F>(&self, oid: Oid, f: F) -> Result<R, ObjectAccessError>
    where
        F: FnOnce(&DObject) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let inspect = Box::new(move |object: Option<&DObject>| {
            let _ = reply.send(match object {
                Some(object) => Ok(f(object)),
                None => Err(ObjectAccessError::NotFound(oid)),
            });
        });
        self.send(Unit::Inspect { oid, f: inspect }).await?;
        rx.await.map_err(|_| ObjectAccessError::ManagerClosed)?
    }

    /// Current full state of an object
    pub async fn snapshot(&self, oid: Oid) -> Result<ObjectSnapshot, ObjectAccessError> {
        self.with_object(oid, |object| object.snapshot()).await
    }

    /// Runs a closure on the event loop at the next opportunity
    pub async fn run_on_loop(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.send(Unit::Task(Box::new(f))).await;
    }

    /// Stops the event loop after the units already queued
    pub async fn shutdown(&self) {
        let _ = self.send(Unit::Shutdown).await;
    }
}

/// Accumulates mutation requests into one compound event so observers see
/// them as a single atomic notification.
///
/// Dropping an uncommitted, non-empty transaction is a programming error:
/// it fails fast in debug builds and logs an error otherwise.
pub struct TransactionBuilder {
    handle: ManagerHandle,
    target: Oid,
    events: Vec<EventBody>,
    transport: Transport,
    committed: bool,
}

impl TransactionBuilder {
    pub fn set_attribute(mut self, name: &str, value: Value) -> Self {
        self.events.push(EventBody::AttributeChanged {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn add_entry(mut self, name: &str, key: EntryKey, entry: Value) -> Self {
        self.events.push(EventBody::EntryAdded {
            name: name.to_string(),
            key,
            entry,
        });
        self
    }

    pub fn remove_entry(mut self, name: &str, key: EntryKey) -> Self {
        self.events.push(EventBody::EntryRemoved {
            name: name.to_string(),
            key,
        });
        self
    }

    pub fn update_entry(mut self, name: &str, key: EntryKey, entry: Value) -> Self {
        self.events.push(EventBody::EntryUpdated {
            name: name.to_string(),
            key,
            entry,
        });
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Posts the accumulated requests: nothing for an empty transaction, a
    /// plain event for a single request, a compound event otherwise
    pub async fn commit(mut self) {
        self.committed = true;
        let events = std::mem::take(&mut self.events);
        match events.len() {
            0 => {}
            1 => {
                let body = events.into_iter().next().unwrap_or(EventBody::Compound {
                    events: Vec::new(),
                });
                self.handle
                    .post_event(DEvent::new(self.target, body).with_transport(self.transport))
                    .await;
            }
            _ => {
                self.handle
                    .post_event(
                        DEvent::compound(self.target, events).with_transport(self.transport),
                    )
                    .await;
            }
        }
    }

    /// Discards the accumulated requests
    pub fn cancel(mut self) {
        self.committed = true;
        self.events.clear();
    }
}

impl Drop for TransactionBuilder {
    fn drop(&mut self) {
        if !self.committed && !self.events.is_empty() {
            tracing::error!(
                target_oid = %self.target,
                pending = self.events.len(),
                "transaction dropped without commit"
            );
            debug_assert!(false, "transaction dropped without commit");
        }
    }
}

/// Owns one event loop and hands out clonable [`ManagerHandle`]s
pub struct ObjectManager {
    handle: ManagerHandle,
}

impl ObjectManager {
    /// Creates the manager and spawns its event loop
    pub fn new(config: ObjectManagerConfig) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let (tx, rx) = mpsc::channel(config.queue_size);
        let core = ManagerCore {
            name: name.clone(),
            objects: HashMap::new(),
            next_oid: 1,
        };
        tokio::spawn(run(core, rx));
        Self {
            handle: ManagerHandle {
                name,
                tx,
                subscriber_queue_size: config.subscriber_queue_size,
            },
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new(ObjectManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn place_spec() -> ObjectSpec {
        ObjectSpec::new("place").attribute("topic").set("occupants")
    }

    async fn fence(handle: &ManagerHandle, oid: Oid) {
        // a state read round-trips through the loop, so everything posted
        // before it has been processed
        let _ = handle.with_object(oid, |_| ()).await;
    }

    #[tokio::test]
    async fn test_attribute_change_and_listener_order() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        handle
            .add_listener(oid, move |obj: &DObject, _event: &DEvent| {
                let _ = first.send((1, obj.attribute("topic").cloned()));
            })
            .await
            .unwrap();
        handle
            .add_listener(oid, move |obj: &DObject, _event: &DEvent| {
                let _ = tx.send((2, obj.attribute("topic").cloned()));
            })
            .await
            .unwrap();

        handle
            .request_attribute_change(oid, "topic", json!("hello"))
            .await;
        fence(&handle, oid).await;

        // listeners fire in registration order, seeing post-application state
        assert_eq!(rx.recv().await.unwrap(), (1, Some(json!("hello"))));
        assert_eq!(rx.recv().await.unwrap(), (2, Some(json!("hello"))));
    }

    #[tokio::test]
    async fn test_unknown_oid_event_does_not_stop_loop() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();

        handle
            .post_event(DEvent::attribute_changed(Oid(999), "topic", json!(1)))
            .await;
        handle
            .request_attribute_change(oid, "topic", json!("still alive"))
            .await;

        let topic = handle
            .with_object(oid, |obj| obj.attribute("topic").cloned())
            .await
            .unwrap();
        assert_eq!(topic, Some(json!("still alive")));
    }

    #[tokio::test]
    async fn test_transaction_is_one_notification() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .add_listener(oid, move |_obj: &DObject, event: &DEvent| {
                let _ = tx.send(event.clone());
            })
            .await
            .unwrap();

        handle
            .transaction(oid)
            .set_attribute("topic", json!("batch"))
            .add_entry("occupants", EntryKey::from("ada"), json!({"name": "ada"}))
            .add_entry("occupants", EntryKey::from("bob"), json!({"name": "bob"}))
            .commit()
            .await;
        fence(&handle, oid).await;

        let event = rx.recv().await.unwrap();
        match event.body {
            EventBody::Compound { events } => assert_eq!(events.len(), 3),
            other => panic!("expected compound event, got {:?}", other),
        }
        // exactly one notification
        assert!(rx.try_recv().is_err());

        let occupants = handle
            .with_object(oid, |obj| obj.entry_set("occupants").unwrap().len())
            .await
            .unwrap();
        assert_eq!(occupants, 2);
    }

    #[tokio::test]
    async fn test_subscribe_snapshot_and_replay_determinism() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();

        handle
            .request_attribute_change(oid, "topic", json!("initial"))
            .await;
        fence(&handle, oid).await;

        let (tx, mut rx) = mpsc::channel(64);
        let (_sub, snapshot) = handle.subscribe(oid, "observer", tx).await.unwrap();
        assert_eq!(snapshot.attributes["topic"], json!("initial"));

        handle
            .request_entry_add(oid, "occupants", EntryKey::Int(7), json!({"id": 7}))
            .await;
        handle
            .request_attribute_change(oid, "topic", json!("later"))
            .await;
        handle
            .request_entry_remove(oid, "occupants", EntryKey::Int(7))
            .await;
        fence(&handle, oid).await;

        // replay the captured log against a fresh mirror
        let mut mirror = DObject::from_snapshot(Oid(1), snapshot);
        while let Ok(event) = rx.try_recv() {
            mirror.apply(&event.body).unwrap();
        }

        let live = handle.snapshot(oid).await.unwrap();
        assert_eq!(mirror.snapshot().attributes, live.attributes);
        assert_eq!(mirror.snapshot().sets, live.sets);
    }

    #[tokio::test]
    async fn test_subscribe_access_denied_and_not_found() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle
            .register_object_with_access(place_spec(), Box::new(|who| who == "trusted"))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let denied = handle.subscribe(oid, "stranger", tx.clone()).await;
        assert_eq!(denied.unwrap_err(), ObjectAccessError::AccessDenied(oid));

        let missing = handle.subscribe(Oid(424242), "trusted", tx.clone()).await;
        assert_eq!(
            missing.unwrap_err(),
            ObjectAccessError::NotFound(Oid(424242))
        );

        assert!(handle.subscribe(oid, "trusted", tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_subscriber_queue_ejects() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        handle.subscribe(oid, "slow", tx).await.unwrap();

        handle.request_attribute_change(oid, "topic", json!(1)).await;
        handle.request_attribute_change(oid, "topic", json!(2)).await;
        fence(&handle, oid).await;

        // the first event fit, the second found the queue full and ejected
        assert_eq!(
            rx.recv().await.unwrap().body,
            EventBody::AttributeChanged {
                name: "topic".to_string(),
                value: json!(1)
            }
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unreliable_event_skipped_not_ejected() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        handle.subscribe(oid, "slow", tx).await.unwrap();

        handle.request_attribute_change(oid, "topic", json!(1)).await;
        // queue now full: an unreliable event is skipped, not fatal
        handle
            .post_event(
                DEvent::message(oid, "tick", vec![]).with_transport(Transport::unreliable(0)),
            )
            .await;
        fence(&handle, oid).await;

        assert_eq!(
            rx.recv().await.unwrap().body,
            EventBody::AttributeChanged {
                name: "topic".to_string(),
                value: json!(1)
            }
        );

        // still subscribed: the next reliable event arrives
        handle.request_attribute_change(oid, "topic", json!(3)).await;
        fence(&handle, oid).await;
        assert_eq!(
            rx.recv().await.unwrap().body,
            EventBody::AttributeChanged {
                name: "topic".to_string(),
                value: json!(3)
            }
        );
    }

    #[tokio::test]
    async fn test_destroy_makes_oid_stale() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();
        handle.destroy_object(oid).await;

        let result = handle.with_object(oid, |_| ()).await;
        assert_eq!(result.unwrap_err(), ObjectAccessError::NotFound(oid));

        // a fresh registration never reuses the oid
        let next = handle.register_object(place_spec()).await.unwrap();
        assert_ne!(next, oid);
    }

    #[tokio::test]
    async fn test_mirror_forwards_local_requests_upstream() {
        let manager = ObjectManager::default();
        let handle = manager.handle();

        let snapshot = ObjectSnapshot {
            oid: Oid(55),
            class: "place".to_string(),
            attributes: [("topic".to_string(), json!("remote"))].into(),
            sets: Default::default(),
        };
        let (upstream_tx, mut upstream_rx) = mpsc::channel(8);
        let mirror_oid = handle
            .register_mirror(snapshot, Some(upstream_tx))
            .await
            .unwrap();

        // a local "set" against the mirror only emits a request upstream
        handle
            .request_attribute_change(mirror_oid, "topic", json!("local write"))
            .await;
        fence(&handle, mirror_oid).await;

        let forwarded = upstream_rx.recv().await.unwrap();
        assert_eq!(forwarded.target, Oid(55));
        let topic = handle
            .with_object(mirror_oid, |obj| obj.attribute("topic").cloned())
            .await
            .unwrap();
        assert_eq!(topic, Some(json!("remote")));

        // the change takes effect when the event comes back from upstream
        handle.post_remote_event(
            mirror_oid,
            DEvent::attribute_changed(Oid(55), "topic", json!("replicated")),
        );
        fence(&handle, mirror_oid).await;
        let topic = handle
            .with_object(mirror_oid, |obj| obj.attribute("topic").cloned())
            .await
            .unwrap();
        assert_eq!(topic, Some(json!("replicated")));
    }

    #[tokio::test]
    async fn test_transaction_cancel_posts_nothing() {
        let manager = ObjectManager::default();
        let handle = manager.handle();
        let oid = handle.register_object(place_spec()).await.unwrap();

        handle
            .transaction(oid)
            .set_attribute("topic", json!("discarded"))
            .cancel();
        fence(&handle, oid).await;

        let topic = handle
            .with_object(oid, |obj| obj.attribute("topic").cloned())
            .await
            .unwrap();
        assert_eq!(topic, Some(Value::Null));
    }
}
