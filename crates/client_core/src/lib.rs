use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use shared::{
    domain::{Key, Path},
    node::{Node, Response},
    protocol::{
        decode_server_message, encode_client_message, ClientMessage, EventEnvelope, ServerMessage,
    },
    resolve::{resolve_key, Values},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

pub mod error;

pub use error::ClientError;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A new value for `key` is in the local cache.
    Updated { key: Key },
    Error(String),
    Closed,
}

/// Operations a front end needs from a model server connection.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn subscribe(&self, keys: Vec<Key>) -> Result<()>;
    async fn unsubscribe(&self, keys: Vec<Key>) -> Result<()>;
    /// Cached value of `root` with every reference substituted.
    async fn resolved(&self, root: &str) -> Node;
    async fn send_event(
        &self,
        path: Path,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Response>;
    fn events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[derive(Default)]
struct ClientState {
    values: Values,
    pending: HashMap<String, oneshot::Sender<Response>>,
    closed: bool,
}

struct ClientInner {
    writer: Mutex<SplitSink<Socket, Message>>,
    state: Mutex<ClientState>,
    next_event: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
}

/// WebSocket connection to a model server, with a local cache of every
/// value pushed to it.
pub struct LiveClient {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
}

impl LiveClient {
    pub async fn connect(server_url: &str) -> Result<Self> {
        let url = ws_url(server_url)?;
        let (socket, _) = connect_async(url.as_str()).await?;
        let (writer, reader) = socket.split();
        let (events, _) = broadcast::channel(1024);

        let inner = Arc::new(ClientInner {
            writer: Mutex::new(writer),
            state: Mutex::new(ClientState::default()),
            next_event: AtomicU64::new(0),
            events,
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&inner), reader));
        info!(%url, "connected to model server");
        Ok(Self { inner, reader })
    }

    pub async fn value(&self, key: &str) -> Option<Node> {
        self.inner.state.lock().await.values.get(key).cloned()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.writer.lock().await.close().await?;
        Ok(())
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        if self.inner.state.lock().await.closed {
            return Err(ClientError::Closed);
        }
        let text = encode_client_message(message)?;
        self.inner
            .writer
            .lock()
            .await
            .send(Message::Text(text))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ModelClient for LiveClient {
    async fn subscribe(&self, keys: Vec<Key>) -> Result<()> {
        self.send(&ClientMessage::Subscribe { keys }).await
    }

    async fn unsubscribe(&self, keys: Vec<Key>) -> Result<()> {
        self.send(&ClientMessage::Unsubscribe { keys }).await
    }

    async fn resolved(&self, root: &str) -> Node {
        resolve_key(root, &self.inner.state.lock().await.values)
    }

    async fn send_event(
        &self,
        path: Path,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let key = format!("e{}", self.inner.next_event.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(ClientError::Closed);
            }
            state.pending.insert(key.clone(), tx);
        }

        let message = ClientMessage::Event {
            key: key.clone(),
            event: EventEnvelope::new(path, payload),
        };
        if let Err(err) = self.send(&message).await {
            self.inner.state.lock().await.pending.remove(&key);
            return Err(err);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.state.lock().await.pending.remove(&key);
                    return Err(ClientError::Timeout {
                        key,
                        millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
            None => rx.await,
        };
        outcome.map_err(|_| ClientError::Closed)
    }

    fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl ClientInner {
    async fn apply(&self, message: ServerMessage) {
        match message {
            ServerMessage::Update { key, val } => {
                self.state.lock().await.values.insert(key.clone(), val);
                let _ = self.events.send(ClientEvent::Updated { key });
            }
            ServerMessage::EventResponse { key, res } => {
                let waiter = self.state.lock().await.pending.remove(&key);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(res);
                    }
                    None => debug!(%key, "response for an event nobody is waiting on"),
                }
            }
        }
    }

    /// Marks the connection closed and fails every pending event.
    async fn shut_down(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.pending.clear();
        }
        let _ = self.events.send(ClientEvent::Closed);
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut reader: SplitStream<Socket>) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match decode_server_message(&text) {
                Ok(message) => inner.apply(message).await,
                Err(err) => {
                    warn!(%err, "ignoring server frame");
                    let _ = inner.events.send(ClientEvent::Error(err.to_string()));
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "websocket read failed");
                let _ = inner
                    .events
                    .send(ClientEvent::Error(format!("websocket read failed: {err}")));
                break;
            }
        }
    }
    inner.shut_down().await;
    info!("model server connection closed");
}

/// WebSocket endpoint for a server given by its `http(s)://` or `ws(s)://` URL.
pub fn ws_url(server_url: &str) -> Result<Url> {
    let invalid = |reason: String| ClientError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let mut url = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot switch to '{scheme}'")))?;
    if !url.path().ends_with("/ws") {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
