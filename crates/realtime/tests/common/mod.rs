//! Test doubles for the transport and the delivery channel
#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use plexmcp_realtime::outbound::{KeyValueStore, MemoryStore};
use plexmcp_realtime::{
    ClientDeps, ConnectionEvent, ConnectionState, Connector, DeliveryChannel, DeliveryError,
    DeliveryReceipt, Identity, PendingOutboundMessage, RealtimeClient, RealtimeConfig,
    StatusReason, Subscription, TransportCommand, TransportError, TransportEvent,
    TransportHandle,
};
use plexmcp_shared::{MessageId, PlexError, SubjectRole, TicketId, UserId};

/// How the fake server answers the next connect attempt
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Accept,
    /// Transport-level failure
    Refuse,
    /// HTTP status on the upgrade handshake
    Reject(u16),
    /// Never completes
    Hang,
}

/// Server end of an accepted fake transport
pub struct FakeServer {
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeServer {
    pub fn push(&self, frame: serde_json::Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        self.events
            .send(TransportEvent::Text(text.to_string()))
            .unwrap();
    }

    pub fn close(&self, code: u16) {
        self.events
            .send(TransportEvent::Closed {
                code,
                reason: "closed by test".to_string(),
            })
            .unwrap();
    }

    /// Commands received so far
    pub fn drain(&mut self) -> Vec<TransportCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// `type` tags of text frames received so far
    pub fn drain_kinds(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|command| match command {
                TransportCommand::Text(text) => {
                    let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                    frame["type"].as_str().map(str::to_string)
                }
                TransportCommand::Close(_) => None,
            })
            .collect()
    }
}

pub struct FakeConnector {
    script: Mutex<VecDeque<Behavior>>,
    attempts: Mutex<Vec<(Instant, Url)>>,
    servers: mpsc::UnboundedSender<FakeServer>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                attempts: Mutex::new(Vec::new()),
                servers,
            }),
            server_rx,
        )
    }

    /// Queue behaviours for upcoming attempts; unscripted attempts are accepted
    pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.script.lock().unwrap().extend(behaviors);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn last_url(&self) -> Option<Url> {
        self.attempts.lock().unwrap().last().map(|(_, url)| url.clone())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<TransportHandle, TransportError> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), url.clone()));
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Accept);

        match behavior {
            Behavior::Accept => {
                let (handle, commands, events) = TransportHandle::pair();
                let _ = self.servers.send(FakeServer { commands, events });
                Ok(handle)
            }
            Behavior::Refuse => Err(TransportError::Connect("connection refused".to_string())),
            Behavior::Reject(status) => Err(TransportError::Rejected { status }),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Delivery channel with scripted failures
#[derive(Default)]
pub struct ScriptedDelivery {
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
    transient_once: Mutex<Vec<String>>,
    rejected: Mutex<Vec<String>>,
    receipts: Mutex<HashMap<String, MessageId>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedDelivery {
    pub fn fail_once(&self, body: &str) {
        self.transient_once.lock().unwrap().push(body.to_string());
    }

    pub fn reject(&self, body: &str) {
        self.rejected.lock().unwrap().push(body.to_string());
    }

    /// Hold delivery of `body` for `delay` of virtual time
    pub fn delay(&self, body: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(body.to_string(), delay);
    }

    /// Server id to return when `body` is delivered
    pub fn receipt_for(&self, body: &str, message_id: MessageId) {
        self.receipts
            .lock()
            .unwrap()
            .insert(body.to_string(), message_id);
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedDelivery {
    async fn deliver(
        &self,
        message: &PendingOutboundMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.attempts.lock().unwrap().push(message.body.clone());

        let delay = self.delays.lock().unwrap().get(&message.body).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut transient = self.transient_once.lock().unwrap();
            if let Some(pos) = transient.iter().position(|b| *b == message.body) {
                transient.remove(pos);
                return Err(DeliveryError::Server { status: 503 });
            }
        }
        if self.rejected.lock().unwrap().contains(&message.body) {
            return Err(DeliveryError::Rejected {
                status: 400,
                error: PlexError::Validation("Message content rejected".to_string()),
            });
        }

        self.delivered.lock().unwrap().push(message.body.clone());
        let message_id = self
            .receipts
            .lock()
            .unwrap()
            .get(&message.body)
            .copied()
            .unwrap_or_default();
        Ok(DeliveryReceipt { message_id })
    }
}

pub const SUBJECT_ID: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

pub fn identity() -> Identity {
    Identity::new(UserId(Uuid::parse_str(SUBJECT_ID).unwrap()), SubjectRole::User)
}

pub fn test_config() -> RealtimeConfig {
    RealtimeConfig::new(Url::parse("ws://realtime.test/api/v1/ws/support").unwrap())
}

/// A client wired to fakes, with every global event captured
pub struct Harness {
    pub client: RealtimeClient,
    pub connector: Arc<FakeConnector>,
    pub servers: mpsc::UnboundedReceiver<FakeServer>,
    pub delivery: Arc<ScriptedDelivery>,
    pub store: Arc<MemoryStore>,
    pub events: mpsc::UnboundedReceiver<(Instant, ConnectionEvent)>,
    _global: Subscription,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self::with_config(test_config(), store)
    }

    pub fn with_config(config: RealtimeConfig, store: Arc<MemoryStore>) -> Self {
        let (connector, servers) = FakeConnector::new();
        let delivery = Arc::new(ScriptedDelivery::default());
        let deps = ClientDeps {
            connector: connector.clone(),
            delivery: delivery.clone(),
            store: store.clone() as Arc<dyn KeyValueStore>,
        };
        let client = RealtimeClient::new(config, deps).unwrap();

        let (event_tx, events) = mpsc::unbounded_channel();
        let global = client.subscribe_global(move |event| {
            let _ = event_tx.send((Instant::now(), event.clone()));
        });

        Self {
            client,
            connector,
            servers,
            delivery,
            store,
            events,
            _global: global,
        }
    }

    /// Next global event, failing the test if none arrives within ten virtual minutes
    pub async fn next_event(&mut self) -> (Instant, ConnectionEvent) {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed")
    }

    /// Skip events until one matches
    pub async fn wait_for(
        &mut self,
        matches: impl Fn(&ConnectionEvent) -> bool,
    ) -> (Instant, ConnectionEvent) {
        loop {
            let (at, event) = self.next_event().await;
            if matches(&event) {
                return (at, event);
            }
        }
    }

    pub async fn wait_for_state(&mut self, state: ConnectionState) -> (Instant, StatusReason) {
        let (at, event) = self
            .wait_for(|event| {
                matches!(event, ConnectionEvent::StatusChanged { state: s, .. } if *s == state)
            })
            .await;
        match event {
            ConnectionEvent::StatusChanged { reason, .. } => (at, reason),
            _ => unreachable!(),
        }
    }

    /// Server end of the next accepted transport
    pub async fn next_server(&mut self) -> FakeServer {
        tokio::time::timeout(Duration::from_secs(600), self.servers.recv())
            .await
            .expect("timed out waiting for a transport")
            .expect("connector dropped")
    }

    /// Init and wait until the connection is open
    pub async fn open(&mut self) -> FakeServer {
        self.client.init(identity()).await.unwrap();
        let server = self.next_server().await;
        self.wait_for_state(ConnectionState::Open).await;
        server
    }

    /// Every event captured so far without waiting
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn new_message_frame(ticket_id: TicketId, id: MessageId, content: &str) -> serde_json::Value {
    json!({
        "type": "new_message",
        "id": id,
        "ticket_id": ticket_id,
        "content": content,
        "sender_id": "0b6f0f0e-5e0a-4a8f-9d51-6f3a0c1d2e3f",
        "sender_type": "admin",
        "timestamp": "2026-01-15T10:30:00Z",
    })
}

pub fn status_frame(ticket_id: TicketId, id: MessageId, status: &str) -> serde_json::Value {
    json!({
        "type": "message_status",
        "message_id": id,
        "status": status,
        "ticket_id": ticket_id,
    })
}
