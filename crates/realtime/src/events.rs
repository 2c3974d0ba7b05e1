//! Wire envelope types and the frame codec
//!
//! Every frame on the transport is one JSON object tagged by `type`, carrying the
//! kind-specific fields plus an RFC 3339 `timestamp`. Decoding happens exactly once,
//! here; everything downstream matches exhaustively on [`EnvelopeBody`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use plexmcp_shared::{MessageId, MessageStatus, SenderType, SubjectRole, TicketId, UserId};

use crate::client::Identity;
use crate::error::CodecError;

// =============================================================================
// Envelope
// =============================================================================

/// One discrete typed message exchanged over the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub body: EnvelopeBody,
    pub timestamp: OffsetDateTime,
}

/// Kind-specific content of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeBody {
    /// Client announces its identity after the transport opens
    ConnectionInit {
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "userType")]
        user_type: SubjectRole,
    },

    /// Client keepalive
    Heartbeat,

    /// Client keepalive (legacy name)
    Ping,

    /// Server keepalive acknowledgement
    HeartbeatAck,

    /// Server keepalive acknowledgement (legacy name)
    Pong,

    /// Client sends a chat message
    ChatMessage(ChatMessage),

    /// Server pushes a chat message
    NewMessage(ChatMessage),

    /// Client reports its own typing state
    Typing(TypingIndicator),

    /// Server pushes another participant's typing state
    TypingIndicator(TypingIndicator),

    /// Delivery/read status, sent in both directions
    MessageStatus(StatusUpdate),

    /// Informational greeting from the server
    ConnectionEstablished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Chat message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub ticket_id: TicketId,
    pub content: String,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    pub sender_type: SenderType,
}

/// Typing indicator payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub ticket_id: TicketId,
    #[serde(rename = "isTyping")]
    pub is_typing: bool,
    pub sender_id: UserId,
}

/// Message status payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub ticket_id: TicketId,
}

/// Closed set of envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    ConnectionInit,
    Heartbeat,
    Ping,
    HeartbeatAck,
    Pong,
    ChatMessage,
    NewMessage,
    Typing,
    TypingIndicator,
    MessageStatus,
    ConnectionEstablished,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 11] = [
        EnvelopeKind::ConnectionInit,
        EnvelopeKind::Heartbeat,
        EnvelopeKind::Ping,
        EnvelopeKind::HeartbeatAck,
        EnvelopeKind::Pong,
        EnvelopeKind::ChatMessage,
        EnvelopeKind::NewMessage,
        EnvelopeKind::Typing,
        EnvelopeKind::TypingIndicator,
        EnvelopeKind::MessageStatus,
        EnvelopeKind::ConnectionEstablished,
    ];

    /// Wire tag for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::ConnectionInit => "connection_init",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::HeartbeatAck => "heartbeat_ack",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::ChatMessage => "chat_message",
            EnvelopeKind::NewMessage => "new_message",
            EnvelopeKind::Typing => "typing",
            EnvelopeKind::TypingIndicator => "typing_indicator",
            EnvelopeKind::MessageStatus => "message_status",
            EnvelopeKind::ConnectionEstablished => "connection_established",
        }
    }

    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            EnvelopeBody::ConnectionInit { .. } => EnvelopeKind::ConnectionInit,
            EnvelopeBody::Heartbeat => EnvelopeKind::Heartbeat,
            EnvelopeBody::Ping => EnvelopeKind::Ping,
            EnvelopeBody::HeartbeatAck => EnvelopeKind::HeartbeatAck,
            EnvelopeBody::Pong => EnvelopeKind::Pong,
            EnvelopeBody::ChatMessage(_) => EnvelopeKind::ChatMessage,
            EnvelopeBody::NewMessage(_) => EnvelopeKind::NewMessage,
            EnvelopeBody::Typing(_) => EnvelopeKind::Typing,
            EnvelopeBody::TypingIndicator(_) => EnvelopeKind::TypingIndicator,
            EnvelopeBody::MessageStatus(_) => EnvelopeKind::MessageStatus,
            EnvelopeBody::ConnectionEstablished { .. } => EnvelopeKind::ConnectionEstablished,
        }
    }
}

impl Envelope {
    /// Wrap a body with the current time
    pub fn new(body: EnvelopeBody) -> Self {
        Self {
            body,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }

    /// Conversation this envelope belongs to, if any
    pub fn ticket_id(&self) -> Option<TicketId> {
        match &self.body {
            EnvelopeBody::ChatMessage(m) | EnvelopeBody::NewMessage(m) => Some(m.ticket_id),
            EnvelopeBody::Typing(t) | EnvelopeBody::TypingIndicator(t) => Some(t.ticket_id),
            EnvelopeBody::MessageStatus(s) => Some(s.ticket_id),
            _ => None,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(EnvelopeBody::Heartbeat)
    }

    pub fn connection_init(identity: &Identity) -> Self {
        Self::new(EnvelopeBody::ConnectionInit {
            user_id: identity.subject_id,
            user_type: identity.subject_role,
        })
    }

    pub fn chat_message(identity: &Identity, ticket_id: TicketId, content: impl Into<String>) -> Self {
        Self::new(EnvelopeBody::ChatMessage(ChatMessage {
            message_id: None,
            ticket_id,
            content: content.into(),
            sender_id: Some(identity.subject_id),
            sender_type: identity.subject_role,
        }))
    }

    pub fn typing(identity: &Identity, ticket_id: TicketId, is_typing: bool) -> Self {
        Self::new(EnvelopeBody::Typing(TypingIndicator {
            ticket_id,
            is_typing,
            sender_id: identity.subject_id,
        }))
    }

    pub fn status(ticket_id: TicketId, message_id: MessageId, status: MessageStatus) -> Self {
        Self::new(EnvelopeBody::MessageStatus(StatusUpdate {
            message_id,
            status,
            ticket_id,
        }))
    }
}

// =============================================================================
// Codec
// =============================================================================

#[derive(Serialize, Deserialize)]
struct Stamp {
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
}

/// Serialize an envelope into one text frame
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let mut frame = serde_json::to_value(&envelope.body).map_err(CodecError::Encode)?;
    let stamp = serde_json::to_value(Stamp {
        timestamp: Some(envelope.timestamp),
    })
    .map_err(CodecError::Encode)?;

    if let (Value::Object(fields), Value::Object(stamp)) = (&mut frame, stamp) {
        fields.extend(stamp);
    }

    serde_json::to_string(&frame).map_err(CodecError::Encode)
}

/// Parse one text frame into an envelope
///
/// Unknown `type` tags are rejected here so callers never see them. A frame
/// without a timestamp is stamped with the time of receipt.
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    let frame: Value = serde_json::from_str(text).map_err(CodecError::Malformed)?;

    let tag = frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingKind)?;
    if EnvelopeKind::from_wire(tag).is_none() {
        return Err(CodecError::UnknownKind(tag.to_string()));
    }

    let body = EnvelopeBody::deserialize(&frame).map_err(CodecError::Malformed)?;
    let stamp = Stamp::deserialize(&frame).map_err(CodecError::Malformed)?;

    Ok(Envelope {
        body,
        timestamp: stamp.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
    })
}
