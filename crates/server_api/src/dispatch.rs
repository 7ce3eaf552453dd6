use std::{panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use model_store::{ModelStore, StoreError};
use serde_json::Value;
use shared::{
    domain::{display_path, Path, PathSegment},
    error::{ApiError, ErrorCode},
    node::{Node, Response},
    protocol::EventEnvelope,
    resolve::{lookup_through, Lookup, MAX_REFERENCE_HOPS},
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::handlers::{HandlerRegistry, Reply};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("missing event handler at `{path}`")]
    InvalidHandler { path: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event handler failed: {message}")]
    HandlerExecution { message: String },
    #[error("event handler timed out after {millis}ms")]
    Timeout { millis: u64 },
}

impl DispatchError {
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::InvalidHandler { .. } => 404,
            DispatchError::Timeout { .. } => 504,
            DispatchError::Store(_) | DispatchError::HandlerExecution { .. } => 500,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::InvalidHandler { .. } => ErrorCode::NotFound,
            DispatchError::Timeout { .. } => ErrorCode::Timeout,
            DispatchError::Store(_) | DispatchError::HandlerExecution { .. } => ErrorCode::Internal,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status();
        let error = ApiError::new(self.code(), self.to_string());
        Response::error(serde_json::to_value(error).unwrap_or(Value::Null)).status(status)
    }
}

/// Routes events fired against the published tree to registered handlers.
#[derive(Clone, Debug)]
pub struct EventDispatcher {
    store: ModelStore,
    handlers: HandlerRegistry,
}

impl EventDispatcher {
    pub fn new(store: ModelStore, handlers: HandlerRegistry) -> Self {
        Self { store, handlers }
    }

    /// Runs the event and always produces a response envelope.
    pub async fn dispatch(&self, event: &EventEnvelope) -> Response {
        match self.try_dispatch(event).await {
            Ok(response) => response,
            Err(error) => {
                warn!(path = %display_path(&event.target.path), %error, "event dispatch failed");
                error.into_response()
            }
        }
    }

    pub async fn try_dispatch(&self, event: &EventEnvelope) -> Result<Response, DispatchError> {
        let path = &event.target.path;
        let target = self.find_target(path).await?;
        let (id, keys, timeout_ms) = match target {
            Node::Event(node) => match node.handler {
                Some(id) => (id, node.args, node.timeout_ms),
                None => return Err(invalid(path)),
            },
            Node::Handler(handler) => (handler.handler, handler.state, None),
            _ => return Err(invalid(path)),
        };
        let handler = self.handlers.get(id).ok_or_else(|| invalid(path))?;

        let mut args = Vec::with_capacity(keys.len() + 1);
        for key in &keys {
            args.push(self.store.get_resolved(key).await?.to_value());
        }
        match &event.payload {
            Value::Null => {}
            Value::Array(items) => args.extend(items.iter().cloned()),
            other => args.push(other.clone()),
        }

        debug!(path = %display_path(path), %id, args = args.len(), "invoking event handler");
        let call = AssertUnwindSafe(async { handler.call(&self.store, args).await }).catch_unwind();
        let outcome = match timeout_ms {
            Some(millis) => tokio::time::timeout(Duration::from_millis(millis), call)
                .await
                .map_err(|_| DispatchError::Timeout { millis })?,
            None => call.await,
        };
        let reply = outcome.map_err(|_| {
            warn!(path = %display_path(path), %id, "event handler panicked");
            DispatchError::HandlerExecution {
                message: "event handler panicked".to_string(),
            }
        })?;
        reply
            .map(Reply::into_response)
            .map_err(|err| DispatchError::HandlerExecution {
                message: format!("{err:#}"),
            })
    }

    /// Node addressed by `[storeKey, ...lookupPath]`, following references
    /// through the store.
    async fn find_target(&self, path: &[PathSegment]) -> Result<Node, DispatchError> {
        let Some((first, rest)) = path.split_first() else {
            return Err(invalid(path));
        };
        let mut key = first.to_string();
        let mut rest: Path = rest.to_vec();

        for _ in 0..MAX_REFERENCE_HOPS {
            let root = match self.store.get(&key).await {
                Ok(node) => node,
                Err(StoreError::UnresolvedReference { .. }) => return Err(invalid(path)),
                Err(error) => return Err(error.into()),
            };
            match lookup_through(&root, &rest) {
                Lookup::Found(Node::Ref(reference)) => {
                    key = reference.key.clone();
                    rest = reference.path.clone();
                }
                Lookup::Found(node) => return Ok(node.clone()),
                Lookup::Redirect {
                    reference,
                    rest: remaining,
                } => {
                    let mut next = reference.path.clone();
                    next.extend_from_slice(remaining);
                    key = reference.key.clone();
                    rest = next;
                }
                Lookup::Missing => return Err(invalid(path)),
            }
        }
        Err(invalid(path))
    }
}

fn invalid(path: &[PathSegment]) -> DispatchError {
    DispatchError::InvalidHandler {
        path: display_path(path),
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
