//! Multi-peer cluster tests over the in-process transport
//!
//! Each test boots real peer managers wired to a shared in-memory node
//! store and transport hub, and exercises membership, node object
//! replication, cross-node calls, and the lock protocol end to end.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use pequi_object::{
    CallKind, InvocationContext, InvocationRegistry, ObjectManager, ObjectManagerConfig,
    ServiceDescriptor,
};
use pequi_peer::node_object;
use pequi_peer::{
    LockKey, LockOutcome, LockState, MemoryNodeStore, MemoryTransport, NodeStore, PeerManager,
    PeerManagerConfig,
};

struct TestNode {
    manager: PeerManager,
    // keeps the object manager's handle alive alongside the peer layer
    _objects: ObjectManager,
}

async fn spawn_node(
    name: &str,
    hub: &MemoryTransport,
    store: &Arc<MemoryNodeStore>,
) -> TestNode {
    let objects = ObjectManager::new(ObjectManagerConfig {
        name: name.to_string(),
        ..Default::default()
    });
    let handle = objects.handle();
    let invocations = InvocationRegistry::new(handle.clone()).await.unwrap();

    let mut config = PeerManagerConfig::new(name, "cluster-secret");
    config.host_name = name.to_string();
    config.heartbeat_interval = Duration::from_millis(40);
    config.heartbeat_delay = Duration::from_millis(5);
    config.stale_window = Duration::from_secs(60);

    let manager = PeerManager::start(
        config,
        handle,
        invocations,
        store.clone(),
        Arc::new(hub.clone()),
    )
    .await
    .unwrap();

    TestNode {
        manager,
        _objects: objects,
    }
}

async fn eventually<F, Fut>(mut probe: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_connected(a: &PeerManager, b: &PeerManager) {
    let (a, b) = (a.clone(), b.clone());
    eventually(
        move || {
            let (a, b) = (a.clone(), b.clone());
            async move {
                a.connected_peers().contains(&b.node_name().to_string())
                    && b.connected_peers().contains(&a.node_name().to_string())
            }
        },
        "peers to connect",
    )
    .await;
}

#[tokio::test]
async fn test_membership_and_node_object_replication() {
    let hub = MemoryTransport::new();
    let store = Arc::new(MemoryNodeStore::new());

    let alpha = spawn_node("alpha", &hub, &store).await;
    let beta = spawn_node("beta", &hub, &store).await;
    wait_connected(&alpha.manager, &beta.manager).await;

    // alpha's mirror of beta's node object carries beta's published name
    let peer = alpha.manager.get_peer("beta").unwrap();
    let mirror_oid = peer.mirror_oid().unwrap();
    let published = alpha
        .manager
        .object_manager()
        .with_object(mirror_oid, |obj| {
            obj.attribute(node_object::NODE_NAME).cloned()
        })
        .await
        .unwrap();
    assert_eq!(published, Some(json!("beta")));

    alpha.manager.shutdown().await;
    beta.manager.shutdown().await;
}

#[tokio::test]
async fn test_session_location_and_forwarding() {
    let hub = MemoryTransport::new();
    let store = Arc::new(MemoryNodeStore::new());

    let alpha = spawn_node("alpha", &hub, &store).await;
    let beta = spawn_node("beta", &hub, &store).await;
    wait_connected(&alpha.manager, &beta.manager).await;

    // beta exposes a service and hosts a session
    beta.manager
        .invocations()
        .register_provider(
            ServiceDescriptor::new("deliver").method(1, "tell", CallKind::Call),
            |_ctx: &InvocationContext, _method: u16, args: &[Value]| {
                Ok(Some(json!({
                    "delivered": args.first().cloned().unwrap_or(Value::Null)
                })))
            },
        )
        .unwrap();
    beta.manager.advertise_services();
    beta.manager.session_started("user-x");

    // replication makes the session visible from alpha
    let locator = alpha.manager.clone();
    eventually(
        move || {
            let locator = locator.clone();
            async move { locator.locate_session("user-x").await == Some("beta".to_string()) }
        },
        "session to replicate",
    )
    .await;

    // the advertised service list also needs to replicate before forwarding
    let caller = alpha.manager.clone();
    eventually(
        move || {
            let caller = caller.clone();
            async move {
                caller
                    .invoke_on_node("beta", "deliver", 1, vec![json!("hi")])
                    .await
                    .is_ok()
            }
        },
        "service advertisement to replicate",
    )
    .await;

    // "deliver to user-x": locate, then execute on the hosting node
    let host = alpha.manager.locate_session("user-x").await.unwrap();
    let reply = alpha
        .manager
        .invoke_on_node(&host, "deliver", 1, vec![json!("message for user-x")])
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({"delivered": "message for user-x"})));

    // a service nobody advertises is a typed failure, not a crash
    let missing = alpha
        .manager
        .invoke_on_node("beta", "nonesuch", 1, vec![])
        .await;
    assert!(missing.is_err());

    alpha.manager.shutdown().await;
    beta.manager.shutdown().await;
}

#[tokio::test]
async fn test_bad_credentials_refused_without_collateral() {
    use pequi_api::remote::{Frame, PeerCredentials};
    use pequi_peer::PeerTransport;

    let hub = MemoryTransport::new();
    let store = Arc::new(MemoryNodeStore::new());

    let alpha = spawn_node("alpha", &hub, &store).await;
    let beta = spawn_node("beta", &hub, &store).await;
    wait_connected(&alpha.manager, &beta.manager).await;

    // an impostor with the wrong secret is turned away
    let mut conn = hub.connect("alpha:4780").await.unwrap();
    let credentials = PeerCredentials::sign("wrong-secret", "mallory").unwrap();
    conn.tx.send(Frame::Auth { credentials }).await.unwrap();
    match conn.rx.recv().await {
        Some(Frame::AuthFailed { .. }) | None => {}
        other => panic!("impostor was not refused: {:?}", other),
    }

    // the legitimate peer connections are unaffected
    assert!(
        alpha
            .manager
            .connected_peers()
            .contains(&"beta".to_string())
    );

    alpha.manager.shutdown().await;
    beta.manager.shutdown().await;
}

#[tokio::test]
async fn test_lock_lifecycle_across_peers() {
    let hub = MemoryTransport::new();
    let store = Arc::new(MemoryNodeStore::new());

    let alpha = spawn_node("alpha", &hub, &store).await;
    let beta = spawn_node("beta", &hub, &store).await;
    wait_connected(&alpha.manager, &beta.manager).await;

    let key = LockKey::with_id("room", "lobby");

    // alpha acquires with beta's ratification
    let outcome = alpha.manager.acquire_lock(&key).await.unwrap();
    assert_eq!(outcome, LockOutcome::Acquired);
    assert_eq!(alpha.manager.lock_state(&key), LockState::Held);

    // beta sees alpha as the holder once the entry replicates
    let watcher = beta.manager.clone();
    let watched = key.clone();
    eventually(
        move || {
            let watcher = watcher.clone();
            let watched = watched.clone();
            async move { watcher.query_lock(&watched) == Some("alpha".to_string()) }
        },
        "lock to replicate",
    )
    .await;

    // a competing acquire loses to the visible holder
    let beaten = beta.manager.acquire_lock(&key).await.unwrap();
    assert_eq!(beaten, LockOutcome::HeldBy("alpha".to_string()));

    // release is unilateral; beta can then take the lock
    alpha.manager.release_lock(&key).unwrap();
    let watcher = beta.manager.clone();
    let watched = key.clone();
    eventually(
        move || {
            let watcher = watcher.clone();
            let watched = watched.clone();
            async move { watcher.query_lock(&watched).is_none() }
        },
        "release to replicate",
    )
    .await;

    let outcome = beta.manager.acquire_lock(&key).await.unwrap();
    assert_eq!(outcome, LockOutcome::Acquired);

    alpha.manager.shutdown().await;
    beta.manager.shutdown().await;
}

#[tokio::test]
async fn test_lock_race_converges_on_one_winner() {
    let hub = MemoryTransport::new();
    let store = Arc::new(MemoryNodeStore::new());

    let alpha = spawn_node("alpha", &hub, &store).await;
    let beta = spawn_node("beta", &hub, &store).await;
    wait_connected(&alpha.manager, &beta.manager).await;

    let key = LockKey::new("tournament");

    let (from_alpha, from_beta) = tokio::join!(
        alpha.manager.acquire_lock(&key),
        beta.manager.acquire_lock(&key)
    );
    let from_alpha = from_alpha.unwrap();
    let from_beta = from_beta.unwrap();

    // exactly one node won, and both agree on who
    let winner = match (&from_alpha, &from_beta) {
        (LockOutcome::Acquired, LockOutcome::HeldBy(node)) => {
            assert_eq!(node, "alpha");
            "alpha".to_string()
        }
        (LockOutcome::HeldBy(node), LockOutcome::Acquired) => {
            assert_eq!(node, "beta");
            "beta".to_string()
        }
        other => panic!("race did not converge on one winner: {:?}", other),
    };

    let watcher_a = alpha.manager.clone();
    let watcher_b = beta.manager.clone();
    let watched = key.clone();
    let expected = winner.clone();
    eventually(
        move || {
            let watcher_a = watcher_a.clone();
            let watcher_b = watcher_b.clone();
            let watched = watched.clone();
            let expected = expected.clone();
            async move {
                watcher_a.query_lock(&watched) == Some(expected.clone())
                    && watcher_b.query_lock(&watched) == Some(expected)
            }
        },
        "both peers to agree on the lock owner",
    )
    .await;

    alpha.manager.shutdown().await;
    beta.manager.shutdown().await;
}

#[tokio::test]
async fn test_pending_acquire_until_peer_departs() {
    let hub = MemoryTransport::new();
    // asymmetric stores: alpha knows about beta, but beta never learns of
    // alpha, so beta never mirrors alpha's node object and never sees (or
    // ratifies) its lock claims: a one-way-reachable peer
    let alpha_store = Arc::new(MemoryNodeStore::new());
    let beta_store = Arc::new(MemoryNodeStore::new());

    let alpha = spawn_node("alpha", &hub, &alpha_store).await;
    let beta = spawn_node("beta", &hub, &beta_store).await;

    let mut beta_record = pequi_api::model::NodeRecord::new("beta", "beta", None, None, 4780);
    beta_record.last_updated = pequi_common::now_millis();
    alpha_store.upsert(beta_record).await.unwrap();

    let watcher = alpha.manager.clone();
    eventually(
        move || {
            let watcher = watcher.clone();
            async move { watcher.connected_peers().contains(&"beta".to_string()) }
        },
        "alpha to connect to beta",
    )
    .await;

    let key = LockKey::new("frozen");
    let claimant = alpha.manager.clone();
    let claimed = key.clone();
    let attempt = tokio::spawn(async move { claimant.acquire_lock(&claimed).await });

    // the claim stays pending while the silent peer is a member
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alpha.manager.lock_state(&key), LockState::PendingAcquire);

    // the peer departs: implicit ratification completes the claim
    alpha_store.mark_shutdown("beta").await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), attempt)
        .await
        .expect("acquisition still pending after departure")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, LockOutcome::Acquired);
    assert_eq!(alpha.manager.lock_state(&key), LockState::Held);

    beta.manager.shutdown().await;
    alpha.manager.shutdown().await;
}

#[tokio::test]
async fn test_departed_holder_locks_are_force_cleared() {
    let hub = MemoryTransport::new();
    let store = Arc::new(MemoryNodeStore::new());

    let alpha = spawn_node("alpha", &hub, &store).await;
    let beta = spawn_node("beta", &hub, &store).await;
    wait_connected(&alpha.manager, &beta.manager).await;

    let key = LockKey::with_id("shard", "7");
    assert_eq!(
        beta.manager.acquire_lock(&key).await.unwrap(),
        LockOutcome::Acquired
    );

    let watcher = alpha.manager.clone();
    let watched = key.clone();
    eventually(
        move || {
            let watcher = watcher.clone();
            let watched = watched.clone();
            async move { watcher.query_lock(&watched) == Some("beta".to_string()) }
        },
        "lock to replicate",
    )
    .await;

    // beta goes away while holding the lock
    beta.manager.shutdown().await;

    let watcher = alpha.manager.clone();
    let watched = key.clone();
    eventually(
        move || {
            let watcher = watcher.clone();
            let watched = watched.clone();
            async move {
                watcher.query_lock(&watched).is_none()
                    && watcher.connected_peers().is_empty()
            }
        },
        "departed holder's lock to clear",
    )
    .await;

    // and the resource is acquirable again
    assert_eq!(
        alpha.manager.acquire_lock(&key).await.unwrap(),
        LockOutcome::Acquired
    );

    alpha.manager.shutdown().await;
}
