//! Server-side event handlers, addressed from the model tree by [`HandlerId`].

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use model_store::ModelStore;
use serde_json::Value;
use shared::{domain::HandlerId, node::Response};

/// What a handler hands back: a bare value, or a full response envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Response(Response),
}

impl Reply {
    pub fn into_response(self) -> Response {
        match self {
            Reply::Value(value) => Response::ok(value),
            Reply::Response(response) => response,
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl From<Response> for Reply {
    fn from(value: Response) -> Self {
        Reply::Response(value)
    }
}

pub type HandlerResult = anyhow::Result<Reply>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// `args` holds the declared state values first, then the event payload.
    async fn call(&self, store: &ModelStore, args: Vec<Value>) -> HandlerResult;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ModelStore, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, store: &ModelStore, args: Vec<Value>) -> HandlerResult {
        (self.func)(store.clone(), args).await
    }
}

pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(ModelStore, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { func }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<HandlerId, Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: impl EventHandler + 'static) -> HandlerId {
        let id = HandlerId::random();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}
