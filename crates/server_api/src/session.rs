use std::sync::Arc;

use chrono::Utc;
use model_store::{ModelStore, StoreError};
use shared::{
    domain::{ClientId, Key},
    node::Node,
    protocol::{ClientMessage, EventEnvelope, ServerMessage},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{
    dispatch::EventDispatcher,
    subscriptions::{ListenerTable, SubscriptionManager},
    EventRecord,
};

/// One connected client as seen by the transport: messages go in through
/// [`ClientConnection::send`], pushes come out of [`ClientConnection::recv`].
#[derive(Debug)]
pub struct ClientConnection {
    id: ClientId,
    inbox: mpsc::UnboundedSender<ClientMessage>,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl ClientConnection {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queues a message for the client's session. Returns `false` once the
    /// session has ended.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.inbox.send(message).is_ok()
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.outbound.recv().await
    }

    pub fn into_parts(
        self,
    ) -> (
        ClientId,
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.id, self.inbox, self.outbound)
    }
}

/// What the service keeps per client.
pub(crate) struct SessionHandle {
    pub(crate) inbox: mpsc::UnboundedSender<ClientMessage>,
    pub(crate) listeners: Arc<ListenerTable>,
}

/// Serializes one client's inbound messages and change notifications.
pub(crate) struct Session {
    client_id: ClientId,
    subscriptions: SubscriptionManager,
    dispatcher: EventDispatcher,
    events: broadcast::Sender<EventRecord>,
    inbox: mpsc::UnboundedReceiver<ClientMessage>,
    changes: mpsc::UnboundedReceiver<Key>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

pub(crate) fn open(
    client_id: ClientId,
    store: ModelStore,
    dispatcher: EventDispatcher,
    events: broadcast::Sender<EventRecord>,
) -> (Session, SessionHandle, ClientConnection) {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (changes_tx, changes_rx) = mpsc::unbounded_channel::<Key>();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let subscriptions = SubscriptionManager::new(
        store,
        Arc::new(move |key: &str| {
            let _ = changes_tx.send(key.to_string());
        }),
    );
    let handle = SessionHandle {
        inbox: inbox_tx.clone(),
        listeners: subscriptions.listeners(),
    };
    let session = Session {
        client_id,
        subscriptions,
        dispatcher,
        events,
        inbox: inbox_rx,
        changes: changes_rx,
        outbound: outbound_tx,
    };
    let connection = ClientConnection {
        id: client_id,
        inbox: inbox_tx,
        outbound: outbound_rx,
    };
    (session, handle, connection)
}

impl Session {
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(key) = self.changes.recv() => {
                    self.subscriptions.mark_stale(&key);
                    self.push_changes().await;
                }
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = self.outbound.closed() => break,
            }
        }
        self.subscriptions.release();
        debug!(client_id = %self.client_id, "session ended");
    }

    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { keys } => {
                for key in keys {
                    let result = self.subscriptions.activate(key).await;
                    self.push(result);
                }
            }
            ClientMessage::Unsubscribe { keys } => {
                for key in keys {
                    let result = self.subscriptions.deactivate(&key).await;
                    self.push(result);
                }
            }
            ClientMessage::Event { key, event } => self.handle_event(key, event).await,
        }
    }

    async fn handle_event(&mut self, key: String, event: EventEnvelope) {
        let _ = self.events.send(EventRecord {
            client_id: Some(self.client_id),
            event: event.clone(),
            received_at: Utc::now(),
        });

        let res = self.dispatcher.dispatch(&event).await;
        // Writes made by the handler reach the client before its response.
        self.push_changes().await;
        self.send(ServerMessage::EventResponse { key, res });
    }

    async fn push_changes(&mut self) {
        while let Ok(key) = self.changes.try_recv() {
            self.subscriptions.mark_stale(&key);
        }
        let result = self.subscriptions.reconcile().await;
        self.push(result);
    }

    fn push(&self, result: Result<Vec<(Key, Node)>, StoreError>) {
        match result {
            Ok(changes) => {
                for (key, val) in changes {
                    self.send(ServerMessage::Update { key, val });
                }
            }
            Err(error) => {
                warn!(client_id = %self.client_id, %error, "failed to refresh subscriptions");
            }
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.subscriptions.listeners().is_released() {
            return;
        }
        if self.outbound.send(message).is_err() {
            debug!(client_id = %self.client_id, "dropping message for closed client");
        }
    }
}
