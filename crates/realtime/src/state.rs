//! Connection state and the events published to global subscribers

use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use plexmcp_shared::{MessageId, TicketId};

use crate::outbound::PendingOutboundMessage;

/// Lifecycle state of the single transport a client owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

/// Machine-readable reason attached to every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    Connecting,
    Connected,
    Closing,
    /// Caller requested `disconnect()`
    Disconnected,
    TransportError,
    ConnectionLost,
    ConnectTimeout,
    ProtocolError,
    /// Server rejected the identity; the UI should prompt re-authentication
    AuthRejected,
    HeartbeatStale,
    ManualReconnect,
    NetworkOnline,
}

impl StatusReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusReason::Connecting => "connecting",
            StatusReason::Connected => "connected",
            StatusReason::Closing => "closing",
            StatusReason::Disconnected => "disconnected",
            StatusReason::TransportError => "transport_error",
            StatusReason::ConnectionLost => "connection_lost",
            StatusReason::ConnectTimeout => "connect_timeout",
            StatusReason::ProtocolError => "protocol_error",
            StatusReason::AuthRejected => "auth_rejected",
            StatusReason::HeartbeatStale => "heartbeat_stale",
            StatusReason::ManualReconnect => "manual_reconnect",
            StatusReason::NetworkOnline => "network_online",
        }
    }
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to global subscribers
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Exactly one per state transition
    StatusChanged {
        state: ConnectionState,
        connected: bool,
        reason: StatusReason,
    },

    /// An automatic reconnect was armed
    ReconnectScheduled { attempt: u32, delay: Duration },

    /// Automatic reconnects stopped; a manual retry is required
    RetriesExhausted { attempts: u32 },

    /// Pending count for a ticket changed
    QueueChanged { ticket_id: TicketId, pending: usize },

    /// A queued message was accepted by the server
    Delivered { local_id: Uuid, message_id: MessageId },

    /// A queued message was permanently rejected and dropped from the queue
    DeliveryFailed {
        message: PendingOutboundMessage,
        error: String,
    },
}

impl ConnectionEvent {
    pub(crate) fn status(state: ConnectionState, reason: StatusReason) -> Self {
        ConnectionEvent::StatusChanged {
            state,
            connected: state.is_open(),
            reason,
        }
    }
}
