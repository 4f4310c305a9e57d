//! Event transport abstraction shared by the runtime and concrete transports.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::sync::mpsc;

use crate::types::{InboundEvent, InboundKind, OutboundEvent};

/// Destination for inbound events of one kind.
pub type EventSink = mpsc::UnboundedSender<InboundEvent>;

/// Persistent bidirectional event connection.
///
/// Emission is fire-and-forget. Connection loss is handled inside the
/// implementation and is never surfaced to callers.
pub trait Transport: Send + Sync + 'static {
    /// Open the connection for `identity_id`. No-op when already connected
    /// as that identity; a different identity replaces the old connection.
    fn connect(&self, identity_id: &str);

    /// Close the connection and invalidate every subscription.
    fn disconnect(&self);

    fn emit(&self, event: OutboundEvent);

    /// Install the single handler for `kind`, replacing any previous one.
    fn subscribe(&self, kind: InboundKind, sink: EventSink) -> Subscription;

    fn unsubscribe(&self, kind: InboundKind);
}

#[derive(Debug)]
struct Handler {
    token: u64,
    sink: EventSink,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_token: u64,
    handlers: HashMap<InboundKind, Handler>,
}

/// One-handler-per-kind table used by transport implementations.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: InboundKind, sink: EventSink) -> Subscription {
        let mut state = self.lock();
        state.next_token += 1;
        let token = state.next_token;
        state.handlers.insert(kind, Handler { token, sink });

        Subscription {
            registry: Arc::downgrade(&self.inner),
            kind,
            token,
        }
    }

    pub fn unsubscribe(&self, kind: InboundKind) {
        self.lock().handlers.remove(&kind);
    }

    /// Drop every handler, e.g. on disconnect or identity change.
    pub fn reset(&self) {
        self.lock().handlers.clear();
    }

    pub fn is_subscribed(&self, kind: InboundKind) -> bool {
        self.lock().handlers.contains_key(&kind)
    }

    /// Route an event to its handler. Returns `false` when nobody listens.
    pub fn dispatch(&self, event: InboundEvent) -> bool {
        let kind = event.kind();
        let mut state = self.lock();
        let Some(handler) = state.handlers.get(&kind) else {
            return false;
        };
        if handler.sink.send(event).is_ok() {
            return true;
        }
        state.handlers.remove(&kind);
        false
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped handler registration; dropping it releases the handler unless a
/// newer subscription already replaced it.
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<Mutex<RegistryState>>,
    kind: InboundKind,
    token: u64,
}

impl Subscription {
    pub fn kind(&self) -> InboundKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut state = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .handlers
            .get(&self.kind)
            .is_some_and(|handler| handler.token == self.token)
        {
            state.handlers.remove(&self.kind);
        }
    }
}

/// Transport connection held for one identity's signed-in lifetime.
///
/// Disconnects exactly once, on `release` or drop.
pub struct TransportLease<T: Transport> {
    transport: Arc<T>,
    identity_id: String,
    released: bool,
}

impl<T: Transport> TransportLease<T> {
    pub fn acquire(transport: Arc<T>, identity_id: impl Into<String>) -> Self {
        let identity_id = identity_id.into();
        transport.connect(&identity_id);
        Self {
            transport,
            identity_id,
            released: false,
        }
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.transport.disconnect();
        }
    }
}

impl<T: Transport> Drop for TransportLease<T> {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    identity_id: Option<String>,
    connects: u32,
    disconnects: u32,
    emitted: Vec<OutboundEvent>,
}

/// In-process transport: records emits and lets the host inject inbound
/// events. Useful for embedding without a server and for tests.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    registry: SubscriptionRegistry,
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an inbound event as if it came from the server.
    ///
    /// Dropped while disconnected, like a real socket.
    pub fn deliver(&self, event: InboundEvent) -> bool {
        if self.lock().identity_id.is_none() {
            return false;
        }
        self.registry.dispatch(event)
    }

    pub fn emitted(&self) -> Vec<OutboundEvent> {
        self.lock().emitted.clone()
    }

    pub fn take_emitted(&self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.lock().emitted)
    }

    pub fn connected_identity(&self) -> Option<String> {
        self.lock().identity_id.clone()
    }

    /// `(connects, disconnects)` performed so far.
    pub fn connection_counts(&self) -> (u32, u32) {
        let state = self.lock();
        (state.connects, state.disconnects)
    }

    pub fn is_subscribed(&self, kind: InboundKind) -> bool {
        self.registry.is_subscribed(kind)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, identity_id: &str) {
        let mut state = self.lock();
        if state.identity_id.as_deref() == Some(identity_id) {
            return;
        }
        if state.identity_id.is_some() {
            state.disconnects += 1;
            self.registry.reset();
        }
        state.identity_id = Some(identity_id.to_owned());
        state.connects += 1;
    }

    fn disconnect(&self) {
        let mut state = self.lock();
        if state.identity_id.take().is_some() {
            state.disconnects += 1;
        }
        self.registry.reset();
    }

    fn emit(&self, event: OutboundEvent) {
        let mut state = self.lock();
        if state.identity_id.is_some() {
            state.emitted.push(event);
        }
    }

    fn subscribe(&self, kind: InboundKind, sink: EventSink) -> Subscription {
        self.registry.subscribe(kind, sink)
    }

    fn unsubscribe(&self, kind: InboundKind) {
        self.registry.unsubscribe(kind);
    }
}
