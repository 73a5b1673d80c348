//! Peer manager
//!
//! The peer manager publishes this node's record into the shared liveness
//! store, heartbeats it, discovers the other live nodes, and keeps one
//! authenticated connection per peer over which it mirrors the peer's node
//! object. Lock arbitration and cross-node service calls ride those
//! connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pequi_api::event::{DEvent, EventBody};
use pequi_api::model::{EntryKey, NodeRecord, Oid};
use pequi_api::remote::{Frame, PeerCredentials};
use pequi_common::{PequiError, now_millis};
use pequi_object::{
    CallKind, DObject, EventListener, InvocationContext, InvocationError, InvocationFailure,
    InvocationRegistry, ManagerHandle, ServiceDescriptor,
};

use crate::lock::{DroppedLock, LockHandler, LockKey};
use crate::model::{PeerEvent, PeerManagerConfig, PeerStats};
use crate::net::{PeerConn, PeerTransport};
use crate::node_object::{
    ACQUIRING_LOCK, LOCKS, NodeObjectView, SESSIONS, SessionInfo, node_object_spec,
};
use crate::session::serve_peer;
use crate::store::NodeStore;

/// Name of the service every peer exposes to its peers
pub const PEER_SERVICE: &str = "peer";

/// Peer-service method: report ratification of a lock action
pub const RATIFY_LOCK_METHOD: u16 = 1;

fn peer_service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(PEER_SERVICE).method(RATIFY_LOCK_METHOD, "ratifyLockAction", CallKind::Notify)
}

pub(crate) type RemoteReply = Result<Option<Value>, InvocationError>;

pub(crate) fn decode_reply(method_id: u16, args: Vec<Value>) -> RemoteReply {
    if method_id == pequi_api::event::REQUEST_FAILED_METHOD {
        Err(InvocationError::Failed(
            args.first()
                .and_then(|v| v.as_str())
                .unwrap_or("request failed")
                .to_string(),
        ))
    } else {
        Ok(args.into_iter().next())
    }
}

/// Live connection state for one peer
pub(crate) struct PeerLink {
    pub(crate) mirror_oid: Oid,
    pub(crate) frames_tx: mpsc::Sender<Frame>,
    pub(crate) pending: Arc<DashMap<u64, oneshot::Sender<RemoteReply>>>,
    pub(crate) next_request_id: Arc<AtomicU64>,
    pub(crate) pump: JoinHandle<()>,
}

/// Runtime information for one known peer node
pub struct PeerNode {
    name: String,
    record: RwLock<NodeRecord>,
    link: Mutex<Option<PeerLink>>,
    last_connect_attempt: AtomicI64,
    connecting: AtomicBool,
}

impl PeerNode {
    fn new(record: NodeRecord) -> Self {
        Self {
            name: record.node_name.clone(),
            record: RwLock::new(record),
            link: Mutex::new(None),
            last_connect_attempt: AtomicI64::new(0),
            connecting: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Local oid of this peer's mirrored node object, while connected
    pub fn mirror_oid(&self) -> Option<Oid> {
        self.link.lock().as_ref().map(|l| l.mirror_oid)
    }

    fn record(&self) -> NodeRecord {
        self.record.read().clone()
    }

    fn update_record(&self, record: NodeRecord) {
        *self.record.write() = record;
    }

    /// Whether a reconnect is worth attempting: only when the peer has
    /// checked in since we last tried
    fn should_attempt(&self, window_ms: u64) -> bool {
        let last_attempt = self.last_connect_attempt.load(Ordering::Relaxed);
        last_attempt - self.record.read().last_updated <= window_ms as i64
    }

    fn begin_connecting(&self, now: i64) -> bool {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.last_connect_attempt.store(now, Ordering::Relaxed);
        true
    }

    fn end_connecting(&self) {
        self.connecting.store(false, Ordering::Release);
    }

    fn set_link(&self, link: PeerLink) {
        *self.link.lock() = Some(link);
    }

    fn take_link(&self) -> Option<PeerLink> {
        self.link.lock().take()
    }

    /// Sends a fire-and-forget request to this peer
    pub(crate) fn notify(&self, service: &str, method_id: u16, args: Vec<Value>) -> bool {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return false;
        };
        let request_id = link.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        link.frames_tx
            .try_send(Frame::Request {
                request_id,
                service: service.to_string(),
                method_id,
                args,
            })
            .is_ok()
    }

    /// Sends a request expecting a response correlated by request id
    pub(crate) fn call(
        &self,
        service: &str,
        method_id: u16,
        args: Vec<Value>,
    ) -> Result<oneshot::Receiver<RemoteReply>, InvocationError> {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(InvocationError::Failed(format!(
                "node '{}' is not connected",
                self.name
            )));
        };
        let request_id = link.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        link.pending.insert(request_id, tx);
        let sent = link.frames_tx.try_send(Frame::Request {
            request_id,
            service: service.to_string(),
            method_id,
            args,
        });
        if sent.is_err() {
            link.pending.remove(&request_id);
            return Err(InvocationError::Failed(format!(
                "outbound queue to '{}' is full",
                self.name
            )));
        }
        Ok(rx)
    }
}

pub(crate) struct PeerInner {
    pub(crate) config: PeerManagerConfig,
    pub(crate) omgr: ManagerHandle,
    pub(crate) invocations: InvocationRegistry,
    pub(crate) store: Arc<dyn NodeStore>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) node_oid: Oid,
    pub(crate) node_view: NodeObjectView,
    pub(crate) peers: DashMap<String, Arc<PeerNode>>,
    pub(crate) locks: Mutex<HashMap<LockKey, LockHandler>>,
    pub(crate) lock_owners: DashMap<LockKey, String>,
    pub(crate) releasing: Mutex<HashSet<LockKey>>,
    pub(crate) peer_events: broadcast::Sender<PeerEvent>,
    pub(crate) dropped_locks: broadcast::Sender<DroppedLock>,
    pub(crate) stats: Mutex<PeerStats>,
    pub(crate) running: AtomicBool,
}

/// Coordinates this node's participation in the cluster
#[derive(Clone)]
pub struct PeerManager {
    pub(crate) inner: Arc<PeerInner>,
}

impl PeerManager {
    /// Boots the peer layer: registers the node object, publishes the node
    /// record, starts accepting peer connections, and begins heartbeating.
    pub async fn start(
        config: PeerManagerConfig,
        omgr: ManagerHandle,
        invocations: InvocationRegistry,
        store: Arc<dyn NodeStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<PeerManager, PequiError> {
        if config.node_name.is_empty() {
            return Err(PequiError::IllegalArgument("node name is empty".to_string()));
        }

        let node_oid = omgr
            .register_object(node_object_spec())
            .await
            .map_err(|e| PequiError::InternalError(e.to_string()))?;
        let node_view = NodeObjectView::new(node_oid, omgr.clone());
        node_view.set_node_name(&config.node_name);
        node_view.set_boot_stamp(now_millis());

        let (peer_events, _) = broadcast::channel(64);
        let (dropped_locks, _) = broadcast::channel(64);

        let manager = PeerManager {
            inner: Arc::new(PeerInner {
                omgr: omgr.clone(),
                invocations: invocations.clone(),
                store,
                transport,
                node_oid,
                node_view,
                peers: DashMap::new(),
                locks: Mutex::new(HashMap::new()),
                lock_owners: DashMap::new(),
                releasing: Mutex::new(HashSet::new()),
                peer_events,
                dropped_locks,
                stats: Mutex::new(PeerStats::default()),
                running: AtomicBool::new(true),
                config,
            }),
        };

        // bookkeeping on our own node object (pending-release completion)
        let own_listener = OwnNodeListener {
            manager: manager.clone(),
        };
        omgr.add_listener(node_oid, own_listener)
            .await
            .map_err(|e| PequiError::InternalError(e.to_string()))?;

        // expose the peer service and advertise what we serve
        let provider = manager.clone();
        invocations.register_provider(
            peer_service_descriptor(),
            move |_ctx: &InvocationContext, method_id: u16, args: &[Value]| {
                provider.handle_peer_service(method_id, args)
            },
        )?;
        manager.advertise_services();

        // publish our record
        let record = manager.self_record(now_millis());
        manager.inner.store.upsert(record).await?;

        // accept inbound peer connections
        let listen_addr = manager.inner.config.listen_address();
        let (bound, mut incoming) = manager.inner.transport.listen(&listen_addr).await?;
        info!(node = %manager.node_name(), addr = %bound, "peer manager started");
        let acceptor = manager.clone();
        tokio::spawn(async move {
            while let Some(conn) = incoming.recv().await {
                if !acceptor.is_running() {
                    break;
                }
                tokio::spawn(serve_peer(acceptor.clone(), conn));
            }
        });

        // heartbeat for the lifetime of the node
        let beat = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(beat.inner.config.heartbeat_delay).await;
            while beat.is_running() {
                beat.refresh_peers().await;
                tokio::time::sleep(beat.inner.config.heartbeat_interval).await;
            }
        });

        Ok(manager)
    }

    pub fn node_name(&self) -> &str {
        &self.inner.config.node_name
    }

    /// Oid of this node's published node object
    pub fn node_oid(&self) -> Oid {
        self.inner.node_oid
    }

    pub fn object_manager(&self) -> &ManagerHandle {
        &self.inner.omgr
    }

    pub fn invocations(&self) -> &InvocationRegistry {
        &self.inner.invocations
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Refreshes the advertised service list on the node object
    pub fn advertise_services(&self) {
        let services = self.inner.invocations.service_names();
        self.inner.node_view.set_services(&services);
    }

    /// Names of the peers with a live connection
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner
            .peers
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| e.key().clone())
            .collect()
    }

    pub(crate) fn connected_peer_names(&self) -> Vec<String> {
        self.connected_peers()
    }

    /// A known peer node by name
    pub fn get_peer(&self, name: &str) -> Option<Arc<PeerNode>> {
        self.inner.peers.get(name).map(|e| e.value().clone())
    }

    /// Observer stream of membership changes
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.peer_events.subscribe()
    }

    /// Snapshot of the runtime statistics
    pub fn stats(&self) -> PeerStats {
        self.inner.stats.lock().clone()
    }

    /// Records that a session came up on this node, published to all peers
    pub fn session_started(&self, name: &str) {
        self.inner
            .node_view
            .add_to_sessions(&SessionInfo::new(name));
    }

    /// Records that a session on this node ended
    pub fn session_ended(&self, name: &str) {
        self.inner.node_view.remove_from_sessions(name);
    }

    /// Finds the node hosting a session: this node first, then the mirrors
    pub async fn locate_session(&self, name: &str) -> Option<String> {
        let key = EntryKey::Text(name.to_string());

        let own = key.clone();
        let hosted_here = self
            .inner
            .omgr
            .with_object(self.inner.node_oid, move |obj| {
                obj.entry_set(SESSIONS)
                    .map(|set| set.contains_key(&own))
                    .unwrap_or(false)
            })
            .await
            .unwrap_or(false);
        if hosted_here {
            return Some(self.node_name().to_string());
        }

        let mirrors: Vec<(String, Oid)> = self
            .inner
            .peers
            .iter()
            .filter_map(|e| e.value().mirror_oid().map(|oid| (e.key().clone(), oid)))
            .collect();
        for (peer_name, mirror_oid) in mirrors {
            let probe = key.clone();
            let hosted = self
                .inner
                .omgr
                .with_object(mirror_oid, move |obj| {
                    obj.entry_set(SESSIONS)
                        .map(|set| set.contains_key(&probe))
                        .unwrap_or(false)
                })
                .await
                .unwrap_or(false);
            if hosted {
                return Some(peer_name);
            }
        }
        None
    }

    /// Invokes a service method on a specific node: locally when the node is
    /// this one, otherwise through the peer's connection, correlated by
    /// request id
    pub async fn invoke_on_node(
        &self,
        node: &str,
        service: &str,
        method_id: u16,
        args: Vec<Value>,
    ) -> Result<Option<Value>, InvocationError> {
        self.inner.stats.lock().node_requests += 1;

        if node == self.node_name() {
            return self.inner.invocations.call(service, method_id, args).wait().await;
        }

        let Some(peer) = self.get_peer(node) else {
            return Err(InvocationError::Failed(format!(
                "node '{}' is not connected",
                node
            )));
        };
        let Some(mirror_oid) = peer.mirror_oid() else {
            return Err(InvocationError::Failed(format!(
                "node '{}' is not connected",
                node
            )));
        };

        // resolve the service stub in the peer's published service table
        let wanted = service.to_string();
        let advertised = self
            .inner
            .omgr
            .with_object(mirror_oid, move |obj| {
                obj.attribute(crate::node_object::SERVICES)
                    .and_then(|v| v.as_array().cloned())
                    .map(|services| services.iter().any(|s| s.as_str() == Some(wanted.as_str())))
                    .unwrap_or(false)
            })
            .await
            .unwrap_or(false);
        if !advertised {
            return Err(InvocationError::Failed(format!(
                "node '{}' does not expose service '{}'",
                node, service
            )));
        }

        let rx = peer.call(service, method_id, args)?;
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(InvocationError::Dropped),
        }
    }

    /// Fire-and-forget request to every connected peer; returns how many
    /// peers it went out to
    pub fn broadcast_to_nodes(&self, service: &str, method_id: u16, args: Vec<Value>) -> usize {
        let mut sent = 0;
        for entry in self.inner.peers.iter() {
            if entry.value().notify(service, method_id, args.clone()) {
                sent += 1;
            }
        }
        sent
    }

    pub(crate) fn notify_peer(&self, node: &str, method_id: u16, args: Vec<Value>) -> bool {
        match self.get_peer(node) {
            Some(peer) => peer.notify(PEER_SERVICE, method_id, args),
            None => false,
        }
    }

    /// One heartbeat/refresh cycle: renew our lease, reload the node table,
    /// drop departed peers, connect to new live ones.
    pub async fn refresh_peers(&self) {
        let now = now_millis();
        let name = self.node_name().to_string();
        let window_ms = self.inner.config.stale_window_ms();

        // let the world know that we're alive
        match self.inner.store.heartbeat(&name, now).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.inner.store.upsert(self.self_record(now)).await {
                    warn!(error = %e, "failed to publish node record");
                }
            }
            Err(e) => warn!(error = %e, "node heartbeat failed"),
        }

        let records = match self.inner.store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to load node records");
                return;
            }
        };

        let mut live: HashMap<String, NodeRecord> = HashMap::new();
        for record in records {
            if record.node_name == name || !record.is_live(now, window_ms) {
                continue;
            }
            live.insert(record.node_name.clone(), record);
        }

        // remove peers for which we no longer have up-to-date records
        let departed: Vec<Arc<PeerNode>> = self
            .inner
            .peers
            .iter()
            .filter(|e| !live.contains_key(e.key()))
            .map(|e| e.value().clone())
            .collect();
        for node in departed {
            info!(node = node.name(), "peer departed");
            self.inner.peers.remove(node.name());
            self.disconnect_peer(&node).await;
        }

        // refresh the rest, connecting where needed
        for (peer_name, record) in live {
            let node = match self.inner.peers.get(&peer_name) {
                Some(entry) => entry.value().clone(),
                None => {
                    let node = Arc::new(PeerNode::new(record.clone()));
                    self.inner.peers.insert(peer_name.clone(), node.clone());
                    node
                }
            };
            node.update_record(record);
            if !node.is_connected() && node.should_attempt(window_ms) && node.begin_connecting(now)
            {
                tokio::spawn(connect_peer(self.clone(), node));
            }
        }
    }

    /// Stops the peer layer: flags our record shut down and logs off of
    /// every peer
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.node_name(), "peer manager stopping");
        if let Err(e) = self.inner.store.mark_shutdown(self.node_name()).await {
            warn!(error = %e, "failed to mark node record shut down");
        }
        let nodes: Vec<Arc<PeerNode>> = self
            .inner
            .peers
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.inner.peers.clear();
        for node in nodes {
            self.disconnect_peer(&node).await;
        }
    }

    fn self_record(&self, now: i64) -> NodeRecord {
        let config = &self.inner.config;
        let mut record = NodeRecord::new(
            config.node_name.clone(),
            config.host_name.clone(),
            config.public_host_name.clone(),
            config.region.clone(),
            config.port,
        );
        record.last_updated = now;
        record
    }

    fn handle_peer_service(
        &self,
        method_id: u16,
        args: &[Value],
    ) -> Result<Option<Value>, InvocationFailure> {
        match method_id {
            RATIFY_LOCK_METHOD => {
                let key: LockKey = args
                    .first()
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .ok_or_else(|| InvocationFailure::new("malformed lock key"))?;
                let acquire = args.get(1).and_then(|v| v.as_bool()).unwrap_or(true);
                let from = args
                    .get(2)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| InvocationFailure::new("missing ratifier name"))?
                    .to_string();
                self.ratify_lock_action(&from, &key, acquire);
                Ok(None)
            }
            _ => Err(InvocationFailure::new("unknown peer method")),
        }
    }

    /// Tears down the link of a peer that went away
    pub(crate) async fn peer_link_closed(&self, name: &str) {
        let Some(node) = self.get_peer(name) else {
            return;
        };
        self.disconnect_peer(&node).await;
    }

    async fn disconnect_peer(&self, node: &Arc<PeerNode>) {
        let Some(link) = node.take_link() else {
            return;
        };
        let _ = link.frames_tx.try_send(Frame::Bye);

        // fail anything still waiting on this peer
        let outstanding: Vec<u64> = link.pending.iter().map(|e| *e.key()).collect();
        for request_id in outstanding {
            if let Some((_, tx)) = link.pending.remove(&request_id) {
                let _ = tx.send(Err(InvocationError::Dropped));
            }
        }

        self.inner.omgr.destroy_object(link.mirror_oid).await;
        self.clear_departed_peer_locks(node.name());
        info!(node = node.name(), "disconnected from peer");
        let _ = self.inner.peer_events.send(PeerEvent::Disconnected {
            node: node.name().to_string(),
        });
        // last, after every awaited step: the teardown may be running on the
        // pump task itself, and an early abort would cancel it midway
        link.pump.abort();
    }
}

/// Drives one outbound peer connection to a live link
async fn connect_peer(manager: PeerManager, node: Arc<PeerNode>) {
    if let Err(e) = try_connect(&manager, &node).await {
        info!(node = node.name(), error = %e, "peer not online");
    }
    node.end_connecting();
}

async fn try_connect(manager: &PeerManager, node: &Arc<PeerNode>) -> Result<(), PequiError> {
    let config = &manager.inner.config;
    let record = node.record();
    let addr = record.peer_address(config.region.as_deref());

    let mut conn = manager.inner.transport.connect(&addr).await?;

    // authenticate with the keyed-hash credential
    let credentials = PeerCredentials::sign(&config.shared_secret, config.node_name.clone())
        .map_err(|e| PequiError::AuthError(e.to_string()))?;
    conn.tx
        .send(Frame::Auth { credentials })
        .await
        .map_err(|_| PequiError::transport("connection closed during handshake"))?;
    let node_oid = match conn.rx.recv().await {
        Some(Frame::AuthOk {
            credentials,
            node_oid,
        }) => {
            // mutual authentication: the acceptor must prove it is the node
            // the record claims
            if credentials.node_name != node.name()
                || !credentials.are_valid(&config.shared_secret)
            {
                return Err(PequiError::AuthError(format!(
                    "peer at {} presented invalid credentials",
                    addr
                )));
            }
            node_oid
        }
        Some(Frame::AuthFailed { reason }) => return Err(PequiError::AuthError(reason)),
        _ => return Err(PequiError::transport("handshake failed")),
    };

    // subscribe to the peer's node object over the ordinary replication path
    conn.tx
        .send(Frame::Subscribe { oid: node_oid })
        .await
        .map_err(|_| PequiError::transport("connection closed during subscribe"))?;
    let snapshot = match conn.rx.recv().await {
        Some(Frame::SubscribeOk { snapshot }) => snapshot,
        Some(Frame::SubscribeFailed { reason, .. }) => {
            return Err(PequiError::IllegalState(reason));
        }
        _ => return Err(PequiError::transport("subscribe failed")),
    };

    // locks the peer already held when we arrived
    let initial_locks: Vec<LockKey> = snapshot
        .sets
        .get(LOCKS)
        .map(|set| set.keys().filter_map(LockKey::from_entry_key).collect())
        .unwrap_or_default();

    // local writes against the mirror are forwarded to the owning peer
    let (upstream_tx, mut upstream_rx) = mpsc::channel::<DEvent>(64);
    let upstream_frames = conn.tx.clone();
    tokio::spawn(async move {
        while let Some(event) = upstream_rx.recv().await {
            if upstream_frames.send(Frame::Event { event }).await.is_err() {
                break;
            }
        }
    });

    let mirror_oid = manager
        .inner
        .omgr
        .register_mirror(snapshot, Some(upstream_tx))
        .await
        .map_err(|e| PequiError::InternalError(e.to_string()))?;
    manager
        .inner
        .omgr
        .add_listener(
            mirror_oid,
            NodeMirrorListener {
                manager: manager.clone(),
                peer: node.name().to_string(),
            },
        )
        .await
        .map_err(|e| PequiError::InternalError(e.to_string()))?;

    // hold the pump until the link is registered, so its teardown always
    // finds the link
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let pending: Arc<DashMap<u64, oneshot::Sender<RemoteReply>>> = Arc::new(DashMap::new());
    let pump_manager = manager.clone();
    let pump_name = node.name().to_string();
    let pump_pending = pending.clone();
    let frames_rx = conn.rx;
    let pump = tokio::spawn(async move {
        let _ = ready_rx.await;
        pump_peer(pump_manager, pump_name, mirror_oid, frames_rx, pump_pending).await;
    });

    node.set_link(PeerLink {
        mirror_oid,
        frames_tx: conn.tx.clone(),
        pending,
        next_request_id: Arc::new(AtomicU64::new(0)),
        pump,
    });
    let _ = ready_tx.send(());

    for key in initial_locks {
        manager.peer_added_lock(node.name(), key);
    }

    info!(node = node.name(), addr = %addr, "connected to peer");
    let _ = manager.inner.peer_events.send(PeerEvent::Connected {
        node: node.name().to_string(),
    });
    Ok(())
}

/// Pumps inbound frames of one peer connection: replicated events into the
/// mirror, responses into their pending calls
async fn pump_peer(
    manager: PeerManager,
    peer: String,
    mirror_oid: Oid,
    mut frames_rx: mpsc::Receiver<Frame>,
    pending: Arc<DashMap<u64, oneshot::Sender<RemoteReply>>>,
) {
    while let Some(frame) = frames_rx.recv().await {
        match frame {
            Frame::Event { event } => {
                manager.inner.omgr.post_remote_event(mirror_oid, event);
            }
            Frame::Response {
                request_id,
                method_id,
                args,
            } => {
                if let Some((_, tx)) = pending.remove(&request_id) {
                    let _ = tx.send(decode_reply(method_id, args));
                } else {
                    debug!(node = %peer, request_id, "response for unknown request");
                }
            }
            Frame::Bye => break,
            other => {
                debug!(node = %peer, frame = ?other, "ignoring unexpected frame");
            }
        }
    }
    manager.peer_link_closed(&peer).await;
}

/// Translates replicated node-object events of one peer into peer-manager
/// callbacks
struct NodeMirrorListener {
    manager: PeerManager,
    peer: String,
}

impl NodeMirrorListener {
    fn handle_body(&self, body: &EventBody) {
        match body {
            EventBody::Compound { events } => {
                for event in events {
                    self.handle_body(event);
                }
            }
            EventBody::AttributeChanged { name, value } if name.as_str() == ACQUIRING_LOCK => {
                if value.is_null() {
                    return;
                }
                match serde_json::from_value::<LockKey>(value.clone()) {
                    Ok(key) => self.manager.peer_acquiring_lock(&self.peer, key),
                    Err(e) => warn!(node = %self.peer, error = %e, "malformed lock announcement"),
                }
            }
            EventBody::EntryAdded { name, entry, .. } if name.as_str() == LOCKS => {
                match serde_json::from_value::<LockKey>(entry.clone()) {
                    Ok(key) => self.manager.peer_added_lock(&self.peer, key),
                    Err(e) => warn!(node = %self.peer, error = %e, "malformed lock entry"),
                }
            }
            EventBody::EntryRemoved { name, key } if name.as_str() == LOCKS => {
                if let Some(lock) = LockKey::from_entry_key(key) {
                    self.manager.peer_removed_lock(&self.peer, lock);
                }
            }
            EventBody::EntryAdded { name, key, .. } if name.as_str() == SESSIONS => {
                debug!(node = %self.peer, session = %key, "session appeared on peer");
            }
            EventBody::EntryRemoved { name, key } if name.as_str() == SESSIONS => {
                debug!(node = %self.peer, session = %key, "session left peer");
            }
            _ => {}
        }
    }
}

impl EventListener for NodeMirrorListener {
    fn event_applied(&mut self, _object: &DObject, event: &DEvent) {
        self.handle_body(&event.body);
    }
}

/// Bookkeeping listener on our own node object
struct OwnNodeListener {
    manager: PeerManager,
}

impl OwnNodeListener {
    fn handle_body(&self, body: &EventBody) {
        match body {
            EventBody::Compound { events } => {
                for event in events {
                    self.handle_body(event);
                }
            }
            EventBody::EntryRemoved { name, key } if name.as_str() == LOCKS => {
                // the removal applied: pending release is complete
                if let Some(lock) = LockKey::from_entry_key(key) {
                    self.manager.inner.releasing.lock().remove(&lock);
                }
            }
            _ => {}
        }
    }
}

impl EventListener for OwnNodeListener {
    fn event_applied(&mut self, _object: &DObject, event: &DEvent) {
        self.handle_body(&event.body);
    }
}
