//! Public client handle

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use plexmcp_shared::{MessageId, MessageStatus, SubjectRole, TicketId, UserId};

use crate::config::RealtimeConfig;
use crate::connection::{self, Command, Shared, StatusSnapshot};
use crate::dedup::DedupKind;
use crate::error::{RealtimeError, RealtimeResult};
use crate::events::{ChatMessage, Envelope, StatusUpdate, TypingIndicator};
use crate::outbound::{
    DeliveryChannel, FileStore, FlushOutcome, HttpDeliveryChannel, KeyValueStore, MemoryStore,
    OutboundQueue, PendingOutboundMessage, QueueStorage, StorageError,
};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::state::{ConnectionEvent, ConnectionState};
use crate::transport::{Connector, WebSocketConnector};

/// Who this client connects as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: UserId,
    pub subject_role: SubjectRole,
}

impl Identity {
    pub fn new(subject_id: UserId, subject_role: SubjectRole) -> Self {
        Self {
            subject_id,
            subject_role,
        }
    }
}

/// What happened to a message passed to [`RealtimeClient::send_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open transport
    Sent,
    /// Queued for durable delivery under this local id
    Queued(Uuid),
}

/// External collaborators a client is built from
pub struct ClientDeps {
    pub connector: Arc<dyn Connector>,
    pub delivery: Arc<dyn DeliveryChannel>,
    pub store: Arc<dyn KeyValueStore>,
}

impl ClientDeps {
    /// WebSocket transport, HTTP delivery, and file or in-memory storage
    pub fn from_config(config: &RealtimeConfig) -> Result<Self, StorageError> {
        let store: Arc<dyn KeyValueStore> = match &config.queue_dir {
            Some(dir) => Arc::new(FileStore::open(dir)?),
            None => Arc::new(MemoryStore::new()),
        };

        Ok(Self {
            connector: Arc::new(WebSocketConnector),
            delivery: Arc::new(HttpDeliveryChannel::new(
                &config.api_url,
                config.access_token.clone(),
            )),
            store,
        })
    }
}

/// Handle to one realtime connection
///
/// Cloning is cheap; every clone drives the same connection. The connection task
/// stops when [`shutdown`](Self::shutdown) is called or the last handle is dropped.
#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StatusSnapshot>,
    shared: Arc<Shared>,
    identity: Arc<OnceLock<Identity>>,
}

impl RealtimeClient {
    /// Restore the persisted queue and start the connection task
    ///
    /// Must be called from within a tokio runtime. The client stays
    /// `Disconnected` until [`init`](Self::init). Clients given the same store
    /// must use different [`queue_namespace`](RealtimeConfig::queue_namespace)s.
    pub fn new(config: RealtimeConfig, deps: ClientDeps) -> RealtimeResult<Self> {
        config.validate()?;

        let storage = QueueStorage::new(deps.store, config.queue_namespace.clone());
        let queue = OutboundQueue::restore(storage)?;
        let shared = Arc::new(Shared::new(
            SubscriptionRegistry::new(),
            queue,
            deps.delivery,
            config.dedup_window,
        ));
        let (commands, status) = connection::spawn(config, deps.connector, Arc::clone(&shared));

        Ok(Self {
            commands,
            status,
            shared,
            identity: Arc::new(OnceLock::new()),
        })
    }

    /// Build a client with the default WebSocket and HTTP collaborators
    pub fn from_config(config: RealtimeConfig) -> RealtimeResult<Self> {
        let deps = ClientDeps::from_config(&config)?;
        Self::new(config, deps)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> RealtimeResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| RealtimeError::ClientClosed)?;
        response.await.map_err(|_| RealtimeError::ClientClosed)
    }

    fn notify(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Connection task has stopped - command dropped");
        }
    }

    /// Set the identity and start connecting
    ///
    /// The identity is fixed by the first call. Calls while already connecting
    /// or open return the current state without opening a second transport.
    pub async fn init(&self, identity: Identity) -> RealtimeResult<ConnectionState> {
        if *self.identity.get_or_init(|| identity) != identity {
            return Err(RealtimeError::IdentityMismatch);
        }
        self.request(|reply| Command::Init { identity, reply }).await
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.get().copied()
    }

    /// Write an envelope to the open transport
    ///
    /// Fails with [`RealtimeError::NotConnected`] unless the connection is open.
    pub async fn send(&self, envelope: Envelope) -> RealtimeResult<()> {
        self.request(|reply| Command::Send { envelope, reply }).await?
    }

    /// Send a chat message, queueing it for durable delivery if the connection is down
    pub async fn send_message(
        &self,
        ticket_id: TicketId,
        body: impl Into<String>,
        notify: bool,
    ) -> RealtimeResult<SendOutcome> {
        let body = body.into();

        if let Some(identity) = self.identity() {
            if self.state().is_open() {
                let envelope = Envelope::chat_message(&identity, ticket_id, body.clone());
                match self.send(envelope).await {
                    Ok(()) => return Ok(SendOutcome::Sent),
                    Err(RealtimeError::NotConnected) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let local_id = self.enqueue(PendingOutboundMessage::new(ticket_id, body, notify))?;
        Ok(SendOutcome::Queued(local_id))
    }

    pub async fn send_typing(&self, ticket_id: TicketId, is_typing: bool) -> RealtimeResult<()> {
        let identity = self.identity().ok_or(RealtimeError::NotConnected)?;
        self.send(Envelope::typing(&identity, ticket_id, is_typing)).await
    }

    pub async fn send_status(
        &self,
        ticket_id: TicketId,
        message_id: MessageId,
        status: MessageStatus,
    ) -> RealtimeResult<()> {
        self.send(Envelope::status(ticket_id, message_id, status)).await
    }

    /// Queue a message for durable delivery
    ///
    /// Flushes right away when the connection is open.
    pub fn enqueue(&self, message: PendingOutboundMessage) -> RealtimeResult<Uuid> {
        let ticket_id = message.ticket_id;
        let local_id = message.local_id;

        let pending = self.shared.queue.enqueue(message)?;
        self.shared
            .emit(ConnectionEvent::QueueChanged { ticket_id, pending });

        if self.state().is_open() {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.flush().await;
            });
        }
        Ok(local_id)
    }

    /// Deliver queued messages now
    pub async fn flush(&self) -> Vec<FlushOutcome> {
        self.shared.flush().await
    }

    /// Queued messages for a ticket, oldest first
    pub fn pending(&self, ticket_id: TicketId) -> Vec<PendingOutboundMessage> {
        self.shared.queue.pending(ticket_id)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.pending_count()
    }

    /// Record a message the caller confirmed over its own HTTP client
    pub fn confirm_delivered(&self, message_id: MessageId) {
        self.shared.record_confirmed(message_id, DedupKind::Message);
    }

    /// Record a status change the caller confirmed over its own HTTP client
    pub fn confirm_status(&self, message_id: MessageId) {
        self.shared.record_confirmed(message_id, DedupKind::Status);
    }

    /// Close the connection and suppress automatic reconnection
    ///
    /// No timer fires after this returns.
    pub async fn disconnect(&self) {
        if self.request(|reply| Command::Disconnect { reply }).await.is_err() {
            tracing::debug!("disconnect() after shutdown - nothing to do");
        }
    }

    /// Drop any transport and connect again with a fresh attempt counter
    pub fn reconnect(&self) {
        self.notify(Command::Reconnect);
    }

    /// Signal that the host regained network connectivity
    pub fn network_online(&self) {
        self.notify(Command::NetworkOnline);
    }

    /// Stop the connection task; queued messages stay persisted
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            tracing::debug!("Connection task already stopped");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Automatic retries armed since the last successful open
    pub fn reconnect_attempt(&self) -> u32 {
        self.status.borrow().reconnect_attempt
    }

    /// Watch state and attempt changes
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn subscribe_messages<F>(&self, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe_messages(ticket_id, handler)
    }

    pub fn subscribe_typing<F>(&self, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: Fn(&TypingIndicator) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe_typing(ticket_id, handler)
    }

    pub fn subscribe_status<F>(&self, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe_status(ticket_id, handler)
    }

    pub fn subscribe_global<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe_global(handler)
    }
}
