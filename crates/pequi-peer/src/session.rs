//! Server side of a peer connection
//!
//! A session authenticates the connecting peer first; everything after the
//! handshake is subscription serving, event forwarding, and service request
//! dispatch. A failed handshake refuses this connection only; other peer
//! connections are unaffected.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use pequi_api::event::REQUEST_FAILED_METHOD;
use pequi_api::model::Oid;
use pequi_api::remote::Frame;
use pequi_object::invocation::REQUEST_PROCESSED_METHOD;
use pequi_object::{CallKind, InvocationError, SubscriberId};

use crate::net::PeerConn;
use crate::peer::PeerManager;

pub(crate) async fn serve_peer(manager: PeerManager, mut conn: PeerConn) {
    // the very first frame must authenticate the peer
    let peer_name = match conn.rx.recv().await {
        Some(Frame::Auth { credentials }) => {
            if !credentials.are_valid(&manager.inner.config.shared_secret) {
                warn!(
                    remote = %conn.remote,
                    node = %credentials.node_name,
                    "refusing peer with invalid credentials"
                );
                let _ = conn
                    .tx
                    .send(Frame::AuthFailed {
                        reason: "invalid credentials".to_string(),
                    })
                    .await;
                return;
            }
            credentials.node_name
        }
        other => {
            warn!(remote = %conn.remote, frame = ?other, "connection did not authenticate");
            return;
        }
    };

    // authentication is mutual: present our own credentials back
    let own_credentials = match pequi_api::remote::PeerCredentials::sign(
        &manager.inner.config.shared_secret,
        manager.node_name(),
    ) {
        Ok(credentials) => credentials,
        Err(e) => {
            warn!(error = %e, "cannot mint own peer credentials");
            return;
        }
    };
    if conn
        .tx
        .send(Frame::AuthOk {
            credentials: own_credentials,
            node_oid: manager.node_oid(),
        })
        .await
        .is_err()
    {
        return;
    }
    info!(node = %peer_name, remote = %conn.remote, "peer session started");

    let omgr = manager.object_manager().clone();
    let mut subscriptions: HashMap<Oid, SubscriberId> = HashMap::new();

    while let Some(frame) = conn.rx.recv().await {
        match frame {
            Frame::Subscribe { oid } => {
                let (events_tx, mut events_rx) = omgr.subscriber_channel();
                match omgr.subscribe(oid, peer_name.as_str(), events_tx).await {
                    Ok((subscriber, snapshot)) => {
                        subscriptions.insert(oid, subscriber);
                        if conn.tx.send(Frame::SubscribeOk { snapshot }).await.is_err() {
                            break;
                        }
                        // forward the object's event stream for as long as
                        // the subscription lives; if the manager ejects us,
                        // say goodbye so the peer reconnects cleanly
                        let forward_tx = conn.tx.clone();
                        tokio::spawn(async move {
                            while let Some(event) = events_rx.recv().await {
                                if forward_tx.send(Frame::Event { event }).await.is_err() {
                                    return;
                                }
                            }
                            let _ = forward_tx.try_send(Frame::Bye);
                        });
                    }
                    Err(e) => {
                        debug!(node = %peer_name, oid = %oid, error = %e, "subscription refused");
                        let refused = conn
                            .tx
                            .send(Frame::SubscribeFailed {
                                oid,
                                reason: e.to_string(),
                            })
                            .await;
                        if refused.is_err() {
                            break;
                        }
                    }
                }
            }
            Frame::Unsubscribe { oid } => {
                if let Some(subscriber) = subscriptions.remove(&oid) {
                    omgr.unsubscribe(oid, subscriber).await;
                }
            }
            Frame::Event { event } => {
                // a peer-originated mutation request; just another event
                // producer on this manager
                omgr.post_event(event).await;
            }
            Frame::Request {
                request_id,
                service,
                method_id,
                args,
            } => {
                let registry = manager.invocations().clone();
                match registry.method_kind(&service, method_id) {
                    Some(CallKind::Notify) => {
                        registry.notify(&service, method_id, args);
                    }
                    _ => {
                        // calls (and unknown methods, which produce a typed
                        // failure) are answered off the session loop
                        let reply_tx = conn.tx.clone();
                        tokio::spawn(async move {
                            let reply = registry.call(&service, method_id, args).wait().await;
                            let (method_id, args) = match reply {
                                Ok(value) => (
                                    REQUEST_PROCESSED_METHOD,
                                    value.into_iter().collect::<Vec<_>>(),
                                ),
                                Err(InvocationError::Failed(reason)) => (
                                    REQUEST_FAILED_METHOD,
                                    vec![serde_json::Value::String(reason)],
                                ),
                                Err(InvocationError::Dropped) => (
                                    REQUEST_FAILED_METHOD,
                                    vec![serde_json::Value::String(
                                        "invocation dropped".to_string(),
                                    )],
                                ),
                            };
                            let _ = reply_tx
                                .send(Frame::Response {
                                    request_id,
                                    method_id,
                                    args,
                                })
                                .await;
                        });
                    }
                }
            }
            Frame::Bye => break,
            other => {
                debug!(node = %peer_name, frame = ?other, "ignoring unexpected frame");
            }
        }
    }

    for (oid, subscriber) in subscriptions {
        omgr.unsubscribe(oid, subscriber).await;
    }
    info!(node = %peer_name, "peer session ended");
}
