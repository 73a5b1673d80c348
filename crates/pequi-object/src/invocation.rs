//! Typed service invocation over the event channel
//!
//! A service call is a typed client-side stub, a generic encoder that packs
//! a method id and positional arguments into a request event, and a
//! server-side provider that decodes and runs the real logic. Responses are
//! correlated purely by a caller-generated request id; the one-shot listener
//! registered under that id is discarded on delivery. If no response ever
//! arrives, timing out is the caller's responsibility; the substrate
//! imposes no default timeout.
//!
//! Rather than a generated class per call, each service declares its methods
//! in a descriptor table and one dispatcher drives them all.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use pequi_api::event::{DEvent, EventBody, REQUEST_FAILED_METHOD};
use pequi_api::model::Oid;
use pequi_common::PequiError;

use crate::manager::{ManagerHandle, ObjectAccessError};
use crate::object::{DObject, EventListener, ObjectSpec};

/// Method id acknowledging a processed request
pub const REQUEST_PROCESSED_METHOD: u16 = 1;

/// Whether a method expects a response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// The caller registers a response listener
    Call,
    /// Fire and forget
    Notify,
}

/// One declared service method
#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    pub id: u16,
    pub name: &'static str,
    pub kind: CallKind,
}

/// The declarative method table of one service
#[derive(Clone, Debug)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, id: u16, name: &'static str, kind: CallKind) -> Self {
        self.methods.push(MethodDescriptor { id, name, kind });
        self
    }

    pub fn find(&self, id: u16) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.id == id)
    }
}

/// An application-level failure raised by a provider; delivered to the
/// caller's listener as a failure response, never as a transport fault
#[derive(thiserror::Error, Debug, Clone)]
#[error("{reason}")]
pub struct InvocationFailure {
    pub reason: String,
}

impl InvocationFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// What a caller observes for a call that did not succeed
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The provider reported a typed failure
    #[error("{0}")]
    Failed(String),

    /// The pending listener was discarded before any response arrived
    #[error("invocation dropped")]
    Dropped,
}

/// Context handed to providers; providers run on the event loop and post
/// any follow-up work rather than blocking
pub struct InvocationContext {
    pub handle: ManagerHandle,
}

/// Server-side logic behind one service
pub trait InvocationProvider: Send {
    fn invoke(
        &mut self,
        ctx: &InvocationContext,
        method_id: u16,
        args: &[Value],
    ) -> Result<Option<Value>, InvocationFailure>;
}

impl<F> InvocationProvider for F
where
    F: FnMut(&InvocationContext, u16, &[Value]) -> Result<Option<Value>, InvocationFailure> + Send,
{
    fn invoke(
        &mut self,
        ctx: &InvocationContext,
        method_id: u16,
        args: &[Value],
    ) -> Result<Option<Value>, InvocationFailure> {
        self(ctx, method_id, args)
    }
}

type CallReply = Result<Option<Value>, InvocationError>;
type PendingMap = Arc<DashMap<u64, oneshot::Sender<CallReply>>>;

struct ProviderSlot {
    descriptor: ServiceDescriptor,
    provider: Box<dyn InvocationProvider>,
}

type ProviderMap = Arc<Mutex<HashMap<String, ProviderSlot>>>;

/// Registers providers, hands out stubs, and correlates responses.
///
/// All requests and responses ride the ordinary event channel, targeted at
/// a dedicated dispatch object registered on the manager.
#[derive(Clone)]
pub struct InvocationRegistry {
    handle: ManagerHandle,
    invoid: Oid,
    providers: ProviderMap,
    pending: PendingMap,
    next_request_id: Arc<AtomicU64>,
}

impl InvocationRegistry {
    /// Creates the registry: registers the dispatch object and wires the
    /// dispatching listener onto it
    pub async fn new(handle: ManagerHandle) -> Result<Self, ObjectAccessError> {
        let invoid = handle
            .register_object(ObjectSpec::new("invocationDispatch"))
            .await?;
        let providers: ProviderMap = Arc::new(Mutex::new(HashMap::new()));
        let pending: PendingMap = Arc::new(DashMap::new());

        let listener = DispatchListener {
            handle: handle.clone(),
            invoid,
            providers: providers.clone(),
            pending: pending.clone(),
        };
        handle.add_listener(invoid, listener).await?;

        Ok(Self {
            handle,
            invoid,
            providers,
            pending,
            next_request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Oid of the dispatch object requests are targeted at
    pub fn dispatch_oid(&self) -> Oid {
        self.invoid
    }

    /// Registers the provider behind a service
    pub fn register_provider(
        &self,
        descriptor: ServiceDescriptor,
        provider: impl InvocationProvider + 'static,
    ) -> Result<(), PequiError> {
        let mut providers = self.providers.lock();
        if providers.contains_key(descriptor.name) {
            return Err(PequiError::IllegalState(format!(
                "service '{}' already registered",
                descriptor.name
            )));
        }
        debug!(service = descriptor.name, "registered service provider");
        providers.insert(
            descriptor.name.to_string(),
            ProviderSlot {
                descriptor,
                provider: Box::new(provider),
            },
        );
        Ok(())
    }

    /// Unregisters a service provider
    pub fn clear_provider(&self, service: &str) {
        if self.providers.lock().remove(service).is_none() {
            warn!(service = service, "requested to clear unregistered service");
        }
    }

    /// Names of the currently registered services
    pub fn service_names(&self) -> Vec<String> {
        self.providers.lock().keys().cloned().collect()
    }

    /// The declared kind of a method, if the service and method exist
    pub fn method_kind(&self, service: &str, method_id: u16) -> Option<CallKind> {
        self.providers
            .lock()
            .get(service)
            .and_then(|slot| slot.descriptor.find(method_id))
            .map(|method| method.kind)
    }

    /// A typed stub for calling one service
    pub fn stub(&self, service: impl Into<String>) -> ServiceStub {
        ServiceStub {
            registry: self.clone(),
            service: service.into(),
        }
    }

    /// Issues a request expecting a response; the returned pending call is
    /// the caller's listener, discarded once resolved or dropped
    pub fn call(&self, service: &str, method_id: u16, args: Vec<Value>) -> PendingCall {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        self.handle.try_post_event(DEvent::new(
            self.invoid,
            EventBody::InvocationRequest {
                service: service.to_string(),
                method_id,
                request_id,
                args,
            },
        ));
        PendingCall {
            request_id,
            pending: self.pending.clone(),
            rx,
        }
    }

    /// Issues a fire-and-forget request
    pub fn notify(&self, service: &str, method_id: u16, args: Vec<Value>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handle.try_post_event(DEvent::new(
            self.invoid,
            EventBody::InvocationRequest {
                service: service.to_string(),
                method_id,
                request_id,
                args,
            },
        ));
    }
}

/// Client side of one service: packs method ids and positional arguments
/// into request events
#[derive(Clone)]
pub struct ServiceStub {
    registry: InvocationRegistry,
    service: String,
}

impl ServiceStub {
    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn call(&self, method_id: u16, args: Vec<Value>) -> PendingCall {
        self.registry.call(&self.service, method_id, args)
    }

    pub fn notify(&self, method_id: u16, args: Vec<Value>) {
        self.registry.notify(&self.service, method_id, args);
    }
}

/// The caller's one-shot response listener.
///
/// Dropping it (for instance after a caller-imposed timeout) discards the
/// registration; a late response is then ignored.
pub struct PendingCall {
    request_id: u64,
    pending: PendingMap,
    rx: oneshot::Receiver<CallReply>,
}

impl PendingCall {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Waits for the correlated response
    pub async fn wait(mut self) -> Result<Option<Value>, InvocationError> {
        match (&mut self.rx).await {
            Ok(reply) => reply,
            Err(_) => Err(InvocationError::Dropped),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// Event-loop listener that dispatches requests to providers and resolves
/// pending calls from responses
struct DispatchListener {
    handle: ManagerHandle,
    invoid: Oid,
    providers: ProviderMap,
    pending: PendingMap,
}

impl DispatchListener {
    fn dispatch(&self, service: &str, method_id: u16, args: &[Value]) -> (bool, CallReply) {
        let mut providers = self.providers.lock();
        let Some(slot) = providers.get_mut(service) else {
            debug!(service = service, "request for unregistered service");
            return (
                false,
                Err(InvocationError::Failed(format!(
                    "unknown service '{}'",
                    service
                ))),
            );
        };
        let Some(method) = slot.descriptor.find(method_id) else {
            warn!(
                service = service,
                method_id = method_id,
                "requested to dispatch unknown method"
            );
            return (
                false,
                Err(InvocationError::Failed(format!(
                    "unknown method {} on '{}'",
                    method_id, service
                ))),
            );
        };
        let wants_reply = method.kind == CallKind::Call;

        let ctx = InvocationContext {
            handle: self.handle.clone(),
        };
        // a panicking provider must not take down the event loop
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            slot.provider.invoke(&ctx, method_id, args)
        }));
        let reply = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(InvocationError::Failed(failure.reason)),
            Err(_) => {
                warn!(service = service, method_id = method_id, "provider panicked");
                Err(InvocationError::Failed("internal error".to_string()))
            }
        };
        (wants_reply, reply)
    }
}

impl EventListener for DispatchListener {
    fn event_applied(&mut self, _object: &DObject, event: &DEvent) {
        match &event.body {
            EventBody::InvocationRequest {
                service,
                method_id,
                request_id,
                args,
            } => {
                let (wants_reply, reply) = self.dispatch(service, *method_id, args);
                if !wants_reply && reply.is_ok() {
                    return;
                }
                let (method_id, args) = match reply {
                    Ok(value) => (
                        REQUEST_PROCESSED_METHOD,
                        value.into_iter().collect::<Vec<_>>(),
                    ),
                    Err(e) => (REQUEST_FAILED_METHOD, vec![Value::String(e.to_string())]),
                };
                self.handle.try_post_event(DEvent::new(
                    self.invoid,
                    EventBody::InvocationResponse {
                        request_id: *request_id,
                        method_id,
                        args,
                    },
                ));
            }
            EventBody::InvocationResponse {
                request_id,
                method_id,
                args,
            } => {
                let Some((_, tx)) = self.pending.remove(request_id) else {
                    // the caller's listener already timed out or went away
                    debug!(request_id = request_id, "response for unknown request");
                    return;
                };
                let reply = if *method_id == REQUEST_FAILED_METHOD {
                    Err(InvocationError::Failed(
                        args.first()
                            .and_then(|v| v.as_str())
                            .unwrap_or("request failed")
                            .to_string(),
                    ))
                } else {
                    Ok(args.first().cloned())
                };
                let _ = tx.send(reply);
            }
            _ => {}
        }
    }
}
