pub mod dispatch;
pub mod handlers;
pub mod session;
pub mod subscriptions;

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use chrono::{DateTime, Utc};
use model_store::{Initializer, ModelStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use shared::{
    domain::{ClientId, HandlerId, Key},
    error::{ApiError, ErrorCode},
    node::{EventNode, HandlerNode, Node, Response},
    protocol::{ClientMessage, EventEnvelope},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub use dispatch::{DispatchError, EventDispatcher};
pub use handlers::{handler_fn, EventHandler, HandlerRegistry, HandlerResult, Reply};
pub use session::ClientConnection;

use session::SessionHandle;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An event as seen by observers, stamped with its origin.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// `None` for events dispatched outside a client session.
    pub client_id: Option<ClientId>,
    pub event: EventEnvelope,
    pub received_at: DateTime<Utc>,
}

/// A published model tree with its connected clients.
///
/// Instances are independent: each has its own store, handler table and
/// client registry. Clones share the same instance.
#[derive(Clone)]
pub struct ModelSource {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    store: ModelStore,
    handlers: HandlerRegistry,
    dispatcher: EventDispatcher,
    clients: Mutex<HashMap<ClientId, SessionHandle>>,
    next_client: AtomicU64,
    events: broadcast::Sender<EventRecord>,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSource {
    pub fn new() -> Self {
        Self::with_store(ModelStore::new(), DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_store(store: ModelStore, event_capacity: usize) -> Self {
        let handlers = HandlerRegistry::new();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(SourceInner {
                dispatcher: EventDispatcher::new(store.clone(), handlers.clone()),
                store,
                handlers,
                clients: Mutex::new(HashMap::new()),
                next_client: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn store(&self) -> &ModelStore {
        &self.inner.store
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    pub async fn get(&self, key: &str) -> Result<Node, StoreError> {
        self.inner.store.get(key).await
    }

    pub async fn get_resolved(&self, key: &str) -> Result<Node, StoreError> {
        self.inner.store.get_resolved(key).await
    }

    pub fn update(&self, key: impl Into<Key>, initializer: impl Into<Initializer>) {
        self.inner.store.update(key, initializer);
    }

    pub fn update_root(&self, initializer: impl Into<Initializer>) {
        self.inner.store.update_root(initializer);
    }

    pub fn register(&self, handler: impl EventHandler + 'static) -> HandlerId {
        self.inner.handlers.register(handler)
    }

    /// Registers `func` and returns an event node pointing at it.
    pub fn event<F, Fut>(&self, func: F) -> EventNode
    where
        F: Fn(ModelStore, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        EventNode::new(self.register(handler_fn(func)))
    }

    /// Registers `func` as a handler that receives the resolved values of
    /// `state` ahead of the event payload.
    pub fn bound_handler<F, Fut>(
        &self,
        state: impl IntoIterator<Item = impl Into<Key>>,
        func: F,
    ) -> HandlerNode
    where
        F: Fn(ModelStore, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        HandlerNode::new(self.register(handler_fn(func)), state)
    }

    /// Opens a session for a new client. Must be called inside a tokio runtime.
    pub fn connect(&self) -> ClientConnection {
        let client_id = ClientId(self.inner.next_client.fetch_add(1, Ordering::SeqCst));
        let (session, handle, connection) = session::open(
            client_id,
            self.inner.store.clone(),
            self.inner.dispatcher.clone(),
            self.inner.events.clone(),
        );
        self.clients().insert(client_id, handle);
        let source = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            session.run().await;
            forget_client(&source, client_id);
        });
        info!(%client_id, "client connected");
        connection
    }

    /// Forgets the client and drops all of its store listeners before returning.
    pub fn disconnect(&self, client_id: ClientId) -> bool {
        let Some(handle) = self.clients().remove(&client_id) else {
            return false;
        };
        handle.listeners.release();
        info!(%client_id, "client disconnected");
        true
    }

    pub fn subscribe(&self, client_id: ClientId, key: impl Into<Key>) -> Result<(), ApiError> {
        self.handle_message(
            client_id,
            ClientMessage::Subscribe {
                keys: vec![key.into()],
            },
        )
    }

    pub fn unsubscribe(&self, client_id: ClientId, key: impl Into<Key>) -> Result<(), ApiError> {
        self.handle_message(
            client_id,
            ClientMessage::Unsubscribe {
                keys: vec![key.into()],
            },
        )
    }

    /// Queues an event for the client's session. The `evt-res` carrying
    /// `key` arrives on the client's connection.
    pub fn handle_event(
        &self,
        client_id: ClientId,
        key: impl Into<String>,
        event: EventEnvelope,
    ) -> Result<(), ApiError> {
        self.handle_message(
            client_id,
            ClientMessage::Event {
                key: key.into(),
                event,
            },
        )
    }

    pub fn handle_message(&self, client_id: ClientId, message: ClientMessage) -> Result<(), ApiError> {
        let clients = self.clients();
        let handle = clients
            .get(&client_id)
            .ok_or_else(|| unknown_client(client_id))?;
        handle
            .inbox
            .send(message)
            .map_err(|_| unknown_client(client_id))
    }

    /// Runs an event outside of any client session.
    pub async fn dispatch(&self, event: EventEnvelope) -> Response {
        let _ = self.inner.events.send(EventRecord {
            client_id: None,
            event: event.clone(),
            received_at: Utc::now(),
        });
        debug!(target_path = ?event.target.path, "dispatching event");
        self.inner.dispatcher.dispatch(&event).await
    }

    pub fn observe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.inner.events.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, SessionHandle>> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops the entry of a session that ended without `disconnect`, such as
/// after its connection was dropped. Client ids are never reused.
fn forget_client(source: &Weak<SourceInner>, client_id: ClientId) {
    let Some(inner) = source.upgrade() else {
        return;
    };
    let handle = inner
        .clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&client_id);
    if let Some(handle) = handle {
        handle.listeners.release();
        debug!(%client_id, "session ended without disconnect");
    }
}

fn unknown_client(client_id: ClientId) -> ApiError {
    ApiError::new(ErrorCode::NotFound, format!("client {client_id} is not connected"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
