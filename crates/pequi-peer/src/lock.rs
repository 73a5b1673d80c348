//! Cluster-wide resource locks
//!
//! A lock claim is published through the claimant's node object (the
//! `acquiringLock` broadcast field), and becomes held only once every peer
//! that was live at request time has ratified it. With no peers connected,
//! ratification is vacuous and acquisition is immediate. Release is
//! unilateral and needs no ratification. A peer that departs while claims
//! are pending ratifies implicitly; a peer that departs while holding locks
//! has them force-cleared by the survivors. Two peers racing for the same
//! key converge on a deterministic winner: the lowest node name.
//!
//! There is no independent ratification timeout; membership liveness
//! tracking bounds stuck states.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use pequi_api::model::EntryKey;
use pequi_common::PequiError;

use crate::peer::{PeerManager, RATIFY_LOCK_METHOD};

/// Identifies a lockable resource: a resource class plus an optional
/// instance id. The resource class must not contain `:`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockKey {
    pub resource: String,
    pub id: Option<String>,
}

impl LockKey {
    pub fn new(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        debug_assert!(!resource.contains(':'), "lock resource must not contain ':'");
        Self { resource, id: None }
    }

    pub fn with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        let resource = resource.into();
        debug_assert!(!resource.contains(':'), "lock resource must not contain ':'");
        Self {
            resource,
            id: Some(id.into()),
        }
    }

    /// The entry key under which this lock lives in a node object's lock set
    pub fn entry_key(&self) -> EntryKey {
        EntryKey::Text(self.to_string())
    }

    /// Recovers a lock key from its entry-key rendering
    pub fn from_entry_key(key: &EntryKey) -> Option<LockKey> {
        match key {
            EntryKey::Text(text) => Some(match text.split_once(':') {
                Some((resource, id)) => LockKey {
                    resource: resource.to_string(),
                    id: Some(id.to_string()),
                },
                None => LockKey {
                    resource: text.clone(),
                    id: None,
                },
            }),
            EntryKey::Int(_) => None,
        }
    }
}

impl Display for LockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.resource, id),
            None => write!(f, "{}", self.resource),
        }
    }
}

/// Lifecycle of one key as seen from this node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    PendingAcquire,
    Held,
    PendingRelease,
}

/// How an acquisition attempt ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// This node holds the lock
    Acquired,
    /// Another node got there first
    HeldBy(String),
}

/// Broadcast when this node is forced to drop a lock it believed it held
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DroppedLock {
    pub key: LockKey,
}

/// Tracks one key in a state of resolution: either our own claim awaiting
/// ratification, or another node's claim we have ratified
pub(crate) struct LockHandler {
    /// The claiming node
    pub(crate) node: String,
    /// Peers whose ratification is still outstanding; only meaningful for
    /// our own claims
    pub(crate) pending: HashSet<String>,
    /// Callers waiting for the resolution: the final owner, or `None` when
    /// the claim evaporated
    pub(crate) waiters: Vec<oneshot::Sender<Option<String>>>,
}

impl LockHandler {
    fn own(pending: HashSet<String>, waiter: oneshot::Sender<Option<String>>) -> Self {
        Self {
            node: String::new(), // filled by the caller with the local name
            pending,
            waiters: vec![waiter],
        }
    }

    fn remote(node: &str) -> Self {
        Self {
            node: node.to_string(),
            pending: HashSet::new(),
            waiters: Vec::new(),
        }
    }
}

impl PeerManager {
    /// The visible owner of a lock, if any; during resolution the answer is
    /// not definitive
    pub fn query_lock(&self, key: &LockKey) -> Option<String> {
        self.inner.lock_owners.get(key).map(|e| e.value().clone())
    }

    /// Current lifecycle state of a key
    pub fn lock_state(&self, key: &LockKey) -> LockState {
        if self.inner.releasing.lock().contains(key) {
            return LockState::PendingRelease;
        }
        if self.inner.lock_owners.contains_key(key) {
            return LockState::Held;
        }
        if self.inner.locks.lock().contains_key(key) {
            return LockState::PendingAcquire;
        }
        LockState::Unlocked
    }

    /// Observer stream of locks this node was forced to drop
    pub fn subscribe_dropped_locks(&self) -> broadcast::Receiver<DroppedLock> {
        self.inner.dropped_locks.subscribe()
    }

    /// Acquires a cluster-wide lock.
    ///
    /// Completes with [`LockOutcome::Acquired`] once every peer live at
    /// request time has ratified the claim (immediately when there are
    /// none), or with the name of the node that beat us to it.
    pub async fn acquire_lock(&self, key: &LockKey) -> Result<LockOutcome, PequiError> {
        let self_name = self.node_name().to_string();
        loop {
            enum Plan {
                Owner(String),
                Wait(oneshot::Receiver<Option<String>>),
                Granted,
            }

            let plan = {
                let mut locks = self.inner.locks.lock();
                if let Some(handler) = locks.get_mut(key) {
                    // a resolution is in flight; wait for it
                    let (tx, rx) = oneshot::channel();
                    handler.waiters.push(tx);
                    Plan::Wait(rx)
                } else if let Some(owner) = self.query_lock(key) {
                    Plan::Owner(owner)
                } else {
                    let ratifiers = self.connected_peer_names();
                    if ratifiers.is_empty() {
                        // vacuous ratification
                        Plan::Granted
                    } else {
                        let (tx, rx) = oneshot::channel();
                        let mut handler =
                            LockHandler::own(ratifiers.into_iter().collect(), tx);
                        handler.node = self_name.clone();
                        locks.insert(key.clone(), handler);
                        Plan::Wait(rx)
                    }
                }
            };

            match plan {
                Plan::Granted => {
                    self.grant_local(key);
                    return Ok(LockOutcome::Acquired);
                }
                Plan::Owner(owner) if owner == self_name => return Ok(LockOutcome::Acquired),
                Plan::Owner(owner) => return Ok(LockOutcome::HeldBy(owner)),
                Plan::Wait(rx) => {
                    // announce after the handler is in place so ratifications
                    // can never race ahead of it
                    if self
                        .inner
                        .locks
                        .lock()
                        .get(key)
                        .map(|h| h.node == self_name && !h.pending.is_empty())
                        .unwrap_or(false)
                    {
                        self.inner.node_view.set_acquiring_lock(key);
                    }
                    match rx.await {
                        Ok(Some(owner)) if owner == self_name => {
                            return Ok(LockOutcome::Acquired);
                        }
                        Ok(Some(owner)) => return Ok(LockOutcome::HeldBy(owner)),
                        // the claim evaporated (claimant departed); try again
                        Ok(None) => continue,
                        Err(_) => {
                            return Err(PequiError::IllegalState(
                                "lock resolution abandoned".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Releases a lock held by this node. Unilateral: no ratification is
    /// involved, peers learn of it through the replicated removal.
    pub fn release_lock(&self, key: &LockKey) -> Result<(), PequiError> {
        let self_name = self.node_name();
        match self.query_lock(key) {
            None => {
                warn!(key = %key, "requested to release a lock nobody holds");
                Ok(())
            }
            Some(owner) if owner != self_name => {
                warn!(key = %key, owner = %owner, "tried to release lock held by another peer");
                Ok(())
            }
            Some(_) => {
                self.inner.releasing.lock().insert(key.clone());
                self.inner.lock_owners.remove(key);
                self.inner.node_view.remove_from_locks(key);
                self.inner.stats.lock().locks_released += 1;
                debug!(key = %key, "lock released");
                Ok(())
            }
        }
    }

    /// Acquires the lock, runs the operation, and always releases afterwards
    pub async fn perform_with_lock<F, Fut, R>(
        &self,
        key: &LockKey,
        op: F,
    ) -> Result<R, PequiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        match self.acquire_lock(key).await? {
            LockOutcome::Acquired => {
                let result = op().await;
                self.release_lock(key)?;
                Ok(result)
            }
            LockOutcome::HeldBy(owner) => Err(PequiError::IllegalState(format!(
                "lock {} held by {}",
                key, owner
            ))),
        }
    }

    /// A peer reported ratification of our pending claim
    pub(crate) fn ratify_lock_action(&self, from_node: &str, key: &LockKey, acquire: bool) {
        if !acquire {
            // release is unilateral; nothing to ratify
            debug!(from = from_node, key = %key, "ignoring release ratification");
            return;
        }
        let self_name = self.node_name();
        let waiters = {
            let mut locks = self.inner.locks.lock();
            let Some(handler) = locks.get_mut(key) else {
                // the claim was cancelled or already resolved
                return;
            };
            if handler.node != self_name {
                return;
            }
            if !handler.pending.remove(from_node) {
                debug!(from = from_node, key = %key, "unexpected ratification");
            }
            if handler.pending.is_empty() {
                locks.remove(key).map(|h| h.waiters)
            } else {
                None
            }
        };
        if let Some(waiters) = waiters {
            self.finish_own_claim(key, waiters);
        }
    }

    /// A mirrored peer announced its intent to acquire a lock
    pub(crate) fn peer_acquiring_lock(&self, peer: &str, key: LockKey) {
        // refuse to ratify when we believe someone already owns it
        if let Some(owner) = self.query_lock(&key) {
            warn!(key = %key, node = peer, owner = %owner, "refusing to ratify lock acquisition");
            return;
        }

        let self_name = self.node_name().to_string();
        enum Action {
            Ratify,
            Nothing,
            TakeOver { was_own: bool },
        }

        let action = {
            let mut locks = self.inner.locks.lock();
            enum Standing {
                Vacant,
                Keep,
                Oust,
            }
            let standing = match locks.get(&key) {
                None => Standing::Vacant,
                Some(handler) if handler.node == peer => Standing::Keep,
                // lowest node name wins; the standing claim keeps priority
                Some(handler) if handler.node.as_str() < peer => Standing::Keep,
                Some(_) => Standing::Oust,
            };
            match standing {
                Standing::Vacant => {
                    locks.insert(key.clone(), LockHandler::remote(peer));
                    Action::Ratify
                }
                Standing::Keep => Action::Nothing,
                Standing::Oust => {
                    let (waiters, was_own) = match locks.remove(&key) {
                        Some(handler) => (handler.waiters, handler.node == self_name),
                        None => (Vec::new(), false),
                    };
                    let mut replacement = LockHandler::remote(peer);
                    replacement.waiters = waiters;
                    locks.insert(key.clone(), replacement);
                    Action::TakeOver { was_own }
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Ratify => self.send_ratify(peer, &key),
            Action::TakeOver { was_own } => {
                if was_own {
                    debug!(key = %key, winner = peer, "own lock claim lost the tie-break");
                    self.inner.node_view.clear_acquiring_lock();
                }
                self.send_ratify(peer, &key);
            }
        }
    }

    /// A mirrored peer added a lock to its set
    pub(crate) fn peer_added_lock(&self, peer: &str, key: LockKey) {
        let self_name = self.node_name().to_string();

        // hijack detection: someone else now claims a lock we believe is ours
        if peer != self_name
            && self
                .inner
                .lock_owners
                .get(&key)
                .map(|owner| *owner.value() == self_name)
                .unwrap_or(false)
        {
            warn!(key = %key, node = peer, "peer hijacked lock owned by this node");
            self.inner.stats.lock().locks_hijacked += 1;
            self.inner.node_view.remove_from_locks(&key);
            let _ = self.inner.dropped_locks.send(DroppedLock { key: key.clone() });
        }

        self.inner.lock_owners.insert(key.clone(), peer.to_string());

        let resolved = { self.inner.locks.lock().remove(&key) };
        if let Some(handler) = resolved {
            if handler.node != peer {
                warn!(key = %key, node = peer, claimant = %handler.node,
                    "lock resolved by a node other than its claimant");
            }
            if handler.node == self_name {
                self.inner.node_view.clear_acquiring_lock();
            }
            for waiter in handler.waiters {
                let _ = waiter.send(Some(peer.to_string()));
            }
        }
    }

    /// A mirrored peer removed a lock from its set
    pub(crate) fn peer_removed_lock(&self, peer: &str, key: LockKey) {
        self.inner
            .lock_owners
            .remove_if(&key, |_, owner| owner == peer);

        let resolved = {
            let mut locks = self.inner.locks.lock();
            if locks.get(&key).map(|h| h.node == peer).unwrap_or(false) {
                locks.remove(&key)
            } else {
                None
            }
        };
        if let Some(handler) = resolved {
            for waiter in handler.waiters {
                let _ = waiter.send(None);
            }
        }
    }

    /// Clears every lock trace of a departed peer: locks it held are
    /// force-cleared, claims it was making evaporate, and claims of ours it
    /// had not ratified count it as implicitly ratifying
    pub(crate) fn clear_departed_peer_locks(&self, peer: &str) {
        let self_name = self.node_name().to_string();

        let cleared: Vec<LockKey> = self
            .inner
            .lock_owners
            .iter()
            .filter(|e| e.value() == peer)
            .map(|e| e.key().clone())
            .collect();
        for key in &cleared {
            self.inner.lock_owners.remove(key);
        }
        if !cleared.is_empty() {
            info!(node = peer, count = cleared.len(), "force-cleared locks of departed peer");
        }

        let mut granted: Vec<(LockKey, Vec<oneshot::Sender<Option<String>>>)> = Vec::new();
        let mut evaporated: Vec<Vec<oneshot::Sender<Option<String>>>> = Vec::new();
        {
            let mut locks = self.inner.locks.lock();
            locks.retain(|key, handler| {
                if handler.node == self_name {
                    // departure is implicit ratification
                    handler.pending.remove(peer);
                    if handler.pending.is_empty() {
                        granted.push((key.clone(), std::mem::take(&mut handler.waiters)));
                        return false;
                    }
                    true
                } else if handler.node == peer {
                    evaporated.push(std::mem::take(&mut handler.waiters));
                    false
                } else {
                    true
                }
            });
        }

        for (key, waiters) in granted {
            self.finish_own_claim(&key, waiters);
        }
        for waiters in evaporated {
            for waiter in waiters {
                let _ = waiter.send(None);
            }
        }
    }

    fn finish_own_claim(&self, key: &LockKey, waiters: Vec<oneshot::Sender<Option<String>>>) {
        let self_name = self.node_name().to_string();
        self.grant_local(key);
        self.inner.node_view.clear_acquiring_lock();
        for waiter in waiters {
            let _ = waiter.send(Some(self_name.clone()));
        }
    }

    fn grant_local(&self, key: &LockKey) {
        self.inner
            .lock_owners
            .insert(key.clone(), self.node_name().to_string());
        self.inner.node_view.add_to_locks(key);
        self.inner.stats.lock().locks_acquired += 1;
        debug!(key = %key, "lock acquired");
    }

    fn send_ratify(&self, peer: &str, key: &LockKey) {
        let sent = self.notify_peer(
            peer,
            RATIFY_LOCK_METHOD,
            vec![
                serde_json::to_value(key).unwrap_or(serde_json::Value::Null),
                json!(true),
                json!(self.node_name()),
            ],
        );
        if !sent {
            warn!(key = %key, node = peer, "failed to send lock ratification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_display_and_parse() {
        let plain = LockKey::new("shard");
        assert_eq!(plain.to_string(), "shard");
        assert_eq!(LockKey::from_entry_key(&plain.entry_key()), Some(plain));

        let keyed = LockKey::with_id("room", "lobby-1");
        assert_eq!(keyed.to_string(), "room:lobby-1");
        assert_eq!(LockKey::from_entry_key(&keyed.entry_key()), Some(keyed));

        assert_eq!(LockKey::from_entry_key(&EntryKey::Int(3)), None);
    }

    #[test]
    fn test_lock_key_ordering_matches_tie_break_inputs() {
        // handler priority compares node names, not keys, but keys must be
        // stable map keys
        let a = LockKey::new("a");
        let b = LockKey::new("b");
        assert!(a < b);
        assert_eq!(a, LockKey::new("a"));
    }
}
