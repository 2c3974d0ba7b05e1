//! Connection manager
//!
//! A single background task owns the transport and every timer. The public
//! [`RealtimeClient`](crate::client::RealtimeClient) talks to it over a command
//! channel, so state transitions are serialized without locking the state
//! itself. Each loop iteration waits on whichever of these fires first:
//!
//! - a caller command
//! - an event from the open transport
//! - the result of a connect attempt (tagged with the attempt's generation)
//! - the connect timeout, the armed retry, or the next heartbeat tick

use std::future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use plexmcp_shared::MessageId;

use crate::client::Identity;
use crate::config::RealtimeConfig;
use crate::dedup::{DedupGuard, DedupKind};
use crate::error::{FailureClass, RealtimeError, RealtimeResult, CLOSE_NORMAL};
use crate::events::{self, Envelope, EnvelopeBody};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::outbound::{
    DeliveryChannel, DeliveryError, DeliveryReceipt, FlushObserver, FlushOutcome, OutboundQueue,
    PendingOutboundMessage,
};
use crate::reconnect::{ReconnectScheduler, RetryDecision};
use crate::registry::SubscriptionRegistry;
use crate::state::{ConnectionEvent, ConnectionState, StatusReason};
use crate::transport::{build_transport_url, Connector, TransportCommand, TransportError, TransportEvent, TransportHandle};

/// State shared by the client handle, the connection task and flush tasks
pub(crate) struct Shared {
    pub registry: Arc<SubscriptionRegistry>,
    pub queue: OutboundQueue,
    pub delivery: Arc<dyn DeliveryChannel>,
    dedup: Mutex<DedupGuard>,
}

impl Shared {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        queue: OutboundQueue,
        delivery: Arc<dyn DeliveryChannel>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            delivery,
            dedup: Mutex::new(DedupGuard::new(dedup_window)),
        }
    }

    fn dedup(&self) -> MutexGuard<'_, DedupGuard> {
        self.dedup.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn emit(&self, event: ConnectionEvent) {
        self.registry.dispatch_global(&event);
    }

    /// Record an id observed on the request/response path
    pub fn record_confirmed(&self, id: MessageId, kind: DedupKind) {
        self.dedup().record_confirmed(id, kind, Instant::now());
    }

    fn admit_push(&self, id: MessageId, kind: DedupKind) -> bool {
        self.dedup().admit_push(id, kind, Instant::now())
    }

    /// Flush every ticket, publishing each outcome as it happens
    pub async fn flush(&self) -> Vec<FlushOutcome> {
        self.queue.flush_all(self.delivery.as_ref(), self).await
    }
}

impl FlushObserver for Shared {
    fn delivered(&self, message: &PendingOutboundMessage, receipt: &DeliveryReceipt, remaining: usize) {
        // Recorded before the next delivery so an early push echo is caught
        self.record_confirmed(receipt.message_id, DedupKind::Message);
        self.emit(ConnectionEvent::Delivered {
            local_id: message.local_id,
            message_id: receipt.message_id,
        });
        self.emit(ConnectionEvent::QueueChanged {
            ticket_id: message.ticket_id,
            pending: remaining,
        });
    }

    fn rejected(&self, message: &PendingOutboundMessage, error: &DeliveryError, remaining: usize) {
        self.emit(ConnectionEvent::DeliveryFailed {
            message: message.clone(),
            error: error.to_string(),
        });
        self.emit(ConnectionEvent::QueueChanged {
            ticket_id: message.ticket_id,
            pending: remaining,
        });
    }
}

/// Latest connection status, readable without asking the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    /// Automatic retries armed since the last successful open
    pub reconnect_attempt: u32,
}

pub(crate) enum Command {
    Init {
        identity: Identity,
        reply: oneshot::Sender<ConnectionState>,
    },
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Reconnect,
    NetworkOnline,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type ConnectResult = (u64, Result<TransportHandle, TransportError>);

#[derive(Debug, Clone, Copy)]
struct PendingRetry {
    at: Instant,
    reason: StatusReason,
}

enum Step {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Connected(u64, Result<TransportHandle, TransportError>),
    ConnectTimeout,
    Retry,
    HeartbeatTick,
}

/// Start the connection task
pub(crate) fn spawn(
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<StatusSnapshot>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
    let (connect_tx, connect_rx) = mpsc::unbounded_channel();

    let task = ConnectionTask {
        scheduler: ReconnectScheduler::new(config.reconnect()),
        config,
        connector,
        shared,
        commands: command_rx,
        status: status_tx,
        connect_tx,
        connect_rx,
        identity: None,
        state: ConnectionState::Disconnected,
        transport: None,
        generation: 0,
        connect_task: None,
        connect_deadline: None,
        retry: None,
        heartbeat: None,
        user_disconnected: false,
        timed_out_once: false,
    };
    tokio::spawn(task.run());

    (command_tx, status_rx)
}

struct ConnectionTask {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<StatusSnapshot>,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult>,
    scheduler: ReconnectScheduler,

    identity: Option<Identity>,
    state: ConnectionState,
    transport: Option<TransportHandle>,
    /// Bumped whenever an in-flight connect attempt is abandoned
    generation: u64,
    connect_task: Option<JoinHandle<()>>,
    connect_deadline: Option<Instant>,
    retry: Option<PendingRetry>,
    heartbeat: Option<HeartbeatMonitor>,
    /// Set by `disconnect()`; suppresses automatic reconnection
    user_disconnected: bool,
    /// The first connect timeout of an outage skips backoff
    timed_out_once: bool,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn recv_transport(transport: &mut Option<TransportHandle>) -> Option<TransportEvent> {
    match transport {
        Some(handle) => handle.inbound.recv().await,
        None => future::pending().await,
    }
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let connect_deadline = self.connect_deadline;
            let retry_at = self.retry.map(|retry| retry.at);
            let heartbeat_at = self.heartbeat.as_ref().map(HeartbeatMonitor::next_tick);

            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                event = recv_transport(&mut self.transport) => Step::Transport(event),
                Some((generation, result)) = self.connect_rx.recv() => Step::Connected(generation, result),
                _ = sleep_until_opt(connect_deadline) => Step::ConnectTimeout,
                _ = sleep_until_opt(retry_at) => Step::Retry,
                _ = sleep_until_opt(heartbeat_at) => Step::HeartbeatTick,
            };

            match step {
                Step::Command(Some(command)) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Step::Command(None) => {
                    tracing::debug!("All client handles dropped - stopping connection task");
                    self.disconnect();
                    break;
                }
                Step::Transport(event) => self.on_transport_event(event.unwrap_or_else(TransportEvent::dropped)),
                Step::Connected(generation, result) => self.on_connect_result(generation, result),
                Step::ConnectTimeout => {
                    tracing::warn!(
                        timeout_ms = self.config.connect_timeout.as_millis() as u64,
                        "Connect attempt timed out"
                    );
                    self.fail(FailureClass::Timeout, StatusReason::ConnectTimeout);
                }
                Step::Retry => {
                    if let Some(retry) = self.retry.take() {
                        self.begin_connect(retry.reason);
                    }
                }
                Step::HeartbeatTick => self.on_heartbeat_tick(),
            }
        }

        tracing::info!("Connection task stopped");
    }

    /// Returns false when the task should stop
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Init { identity, reply } => {
                let _ = reply.send(self.init(identity));
            }
            Command::Send { envelope, reply } => {
                let result = if self.state.is_open() {
                    self.write(&envelope)
                } else {
                    Err(RealtimeError::NotConnected)
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Reconnect => self.restart(StatusReason::ManualReconnect),
            Command::NetworkOnline => self.network_online(),
            Command::Shutdown { reply } => {
                self.disconnect();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn init(&mut self, identity: Identity) -> ConnectionState {
        if self.identity.is_none() {
            self.identity = Some(identity);
        }

        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                tracing::debug!(state = ?self.state, "init() while already connecting or open - ignored");
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {
                self.user_disconnected = false;
                self.timed_out_once = false;
                self.scheduler.reset();
                self.begin_connect(StatusReason::Connecting);
            }
        }
        self.state
    }

    fn begin_connect(&mut self, reason: StatusReason) {
        let Some(identity) = self.identity else {
            tracing::warn!("Connect requested before init() - ignored");
            return;
        };

        self.retry = None;
        self.cancel_connect();
        self.set_state(ConnectionState::Connecting, reason);

        let unix_ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let url: Url = match build_transport_url(
            &self.config.server_url,
            &identity,
            self.config.access_token.as_deref(),
            unix_ms,
        ) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "Cannot build transport URL");
                self.fail(e.class(), StatusReason::TransportError);
                return;
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let results = self.connect_tx.clone();

        tracing::info!(
            server = %self.config.server_url,
            attempt = self.scheduler.attempt(),
            reason = %reason,
            "Connecting to realtime server"
        );

        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        self.connect_task = Some(tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = results.send((generation, result));
        }));
    }

    /// Abandon any in-flight connect attempt
    fn cancel_connect(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.generation += 1;
        self.connect_deadline = None;
    }

    fn on_connect_result(&mut self, generation: u64, result: Result<TransportHandle, TransportError>) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            if let Ok(handle) = result {
                let _ = handle.outbound.send(TransportCommand::Close(CLOSE_NORMAL));
            }
            tracing::debug!(generation, "Discarding superseded connect attempt");
            return;
        }

        self.connect_task = None;
        self.connect_deadline = None;

        match result {
            Ok(handle) => self.on_open(handle),
            Err(e) => {
                let reason = match e {
                    TransportError::Rejected { .. } => StatusReason::AuthRejected,
                    _ => StatusReason::TransportError,
                };
                tracing::warn!(error = %e, "Connect attempt failed");
                self.fail(e.class(), reason);
            }
        }
    }

    fn on_open(&mut self, handle: TransportHandle) {
        let now = Instant::now();
        self.scheduler.reset();
        self.timed_out_once = false;
        self.heartbeat = Some(HeartbeatMonitor::start(
            self.config.heartbeat_interval,
            self.config.stale_after,
            now,
        ));
        self.transport = Some(handle);

        if self.shared.queue.pending_count() > 0 {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.flush().await;
            });
        }

        if let Some(identity) = self.identity {
            if let Err(e) = self.write(&Envelope::connection_init(&identity)) {
                tracing::warn!(error = %e, "Failed to send connection_init");
            }
        }

        self.set_state(ConnectionState::Open, StatusReason::Connected);
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text(text) => self.on_frame(&text),
            TransportEvent::Closed { code, reason } => {
                let class = FailureClass::from_close_code(code);
                let status = match class {
                    FailureClass::Fatal => StatusReason::AuthRejected,
                    FailureClass::Protocol => StatusReason::ProtocolError,
                    FailureClass::Transient | FailureClass::Timeout => StatusReason::ConnectionLost,
                };
                tracing::warn!(code, reason = %reason, class = ?class, "Transport closed by server");
                self.fail(class, status);
            }
            TransportEvent::Error(e) => {
                tracing::warn!(error = %e, "Transport error");
                self.fail(FailureClass::Transient, StatusReason::TransportError);
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        let envelope = match events::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable frame");
                return;
            }
        };

        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.record_activity(Instant::now());
        }

        match envelope.body {
            EnvelopeBody::NewMessage(message) | EnvelopeBody::ChatMessage(message) => {
                let admitted = message
                    .message_id
                    .map_or(true, |id| self.shared.admit_push(id, DedupKind::Message));
                if admitted {
                    let handlers = self.shared.registry.dispatch_message(&message);
                    tracing::debug!(ticket_id = %message.ticket_id, handlers, "Dispatched message");
                }
            }
            EnvelopeBody::TypingIndicator(typing) | EnvelopeBody::Typing(typing) => {
                self.shared.registry.dispatch_typing(&typing);
            }
            EnvelopeBody::MessageStatus(update) => {
                if self.shared.admit_push(update.message_id, DedupKind::Status) {
                    self.shared.registry.dispatch_status(&update);
                }
            }
            EnvelopeBody::ConnectionEstablished { message } => {
                tracing::debug!(message = ?message, "Server acknowledged connection");
            }
            EnvelopeBody::HeartbeatAck
            | EnvelopeBody::Pong
            | EnvelopeBody::Heartbeat
            | EnvelopeBody::Ping
            | EnvelopeBody::ConnectionInit { .. } => {}
        }
    }

    fn on_heartbeat_tick(&mut self) {
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return;
        };

        match heartbeat.tick(Instant::now()) {
            HeartbeatAction::SendKeepalive => {
                if let Err(e) = self.write(&Envelope::heartbeat()) {
                    tracing::debug!(error = %e, "Keepalive not sent");
                }
            }
            HeartbeatAction::Stale { .. } => self.restart(StatusReason::HeartbeatStale),
        }
    }

    fn write(&self, envelope: &Envelope) -> RealtimeResult<()> {
        let text = events::encode(envelope)?;
        let transport = self.transport.as_ref().ok_or(RealtimeError::NotConnected)?;
        transport
            .outbound
            .send(TransportCommand::Text(text))
            .map_err(|_| RealtimeError::NotConnected)
    }

    fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            let _ = transport.outbound.send(TransportCommand::Close(CLOSE_NORMAL));
        }
        self.heartbeat = None;
    }

    /// Tear down after a failure and decide whether to retry
    fn fail(&mut self, class: FailureClass, reason: StatusReason) {
        self.cancel_connect();
        self.transport = None;
        self.heartbeat = None;
        self.set_state(ConnectionState::Disconnected, reason);

        if self.user_disconnected {
            return;
        }
        if !class.is_retryable() {
            tracing::warn!(reason = %reason, "Server rejected the connection - not retrying");
            return;
        }
        if class == FailureClass::Timeout && !self.timed_out_once && !self.scheduler.is_exhausted() {
            self.timed_out_once = true;
            let attempt = self.scheduler.record_immediate_retry();
            self.arm_retry(attempt, self.config.manual_reconnect_delay, StatusReason::Connecting);
            return;
        }

        match self.scheduler.next_retry() {
            RetryDecision::Retry { attempt, delay } => {
                self.arm_retry(attempt, delay, StatusReason::Connecting)
            }
            RetryDecision::Exhausted { attempts } => {
                self.publish();
                self.shared.emit(ConnectionEvent::RetriesExhausted { attempts });
            }
        }
    }

    /// Arm the single retry timer, replacing any pending one
    fn arm_retry(&mut self, attempt: u32, delay: Duration, reason: StatusReason) {
        self.retry = Some(PendingRetry {
            at: Instant::now() + delay,
            reason,
        });
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Reconnect scheduled"
        );
        self.publish();
        self.shared
            .emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
    }

    /// Drop the current transport and connect again after a short fixed delay
    ///
    /// Used for manual reconnects and stale connections. The attempt counter is
    /// reset, so the scheduled event reports attempt 0.
    fn restart(&mut self, reason: StatusReason) {
        self.close_transport();
        self.cancel_connect();
        self.user_disconnected = false;
        self.timed_out_once = false;
        self.scheduler.reset();

        if self.identity.is_none() {
            tracing::warn!("Reconnect requested before init() - ignored");
            return;
        }

        self.set_state(ConnectionState::Disconnected, reason);
        self.arm_retry(0, self.config.manual_reconnect_delay, reason);
    }

    fn network_online(&mut self) {
        if self.state != ConnectionState::Disconnected || self.user_disconnected || self.identity.is_none() {
            tracing::debug!(state = ?self.state, "Network online signal ignored");
            return;
        }

        tracing::info!("Network back online - forcing reconnect attempt");
        self.scheduler.reset();
        self.timed_out_once = false;
        self.begin_connect(StatusReason::NetworkOnline);
    }

    fn disconnect(&mut self) {
        self.user_disconnected = true;
        self.retry = None;
        self.cancel_connect();

        if self.state == ConnectionState::Disconnected {
            self.publish();
            return;
        }

        self.set_state(ConnectionState::Closing, StatusReason::Closing);
        self.close_transport();
        self.set_state(ConnectionState::Disconnected, StatusReason::Disconnected);
    }

    /// Transition and notify global subscribers exactly once
    fn set_state(&mut self, state: ConnectionState, reason: StatusReason) {
        if self.state == state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        tracing::info!(from = ?previous, to = ?state, reason = %reason, "Connection state changed");
        self.publish();
        self.shared.emit(ConnectionEvent::status(state, reason));
    }

    fn publish(&self) {
        self.status.send_replace(StatusSnapshot {
            state: self.state,
            reconnect_attempt: self.scheduler.attempt(),
        });
    }
}
