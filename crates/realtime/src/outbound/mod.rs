//! Durable outbound queue
//!
//! Messages the caller committed to deliver while the connection was down are
//! buffered per ticket, persisted so they survive a restart, and flushed in order
//! through the HTTP delivery channel once connectivity returns.
//!
//! # Architecture
//!
//! - **Queue**: per-ticket FIFO with a flush-in-progress flag per ticket
//! - **Storage**: namespaced key-value persistence owned by the queue
//! - **Delivery**: the request/response channel queued messages are sent over

pub mod delivery;
pub mod queue;
pub mod storage;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use plexmcp_shared::TicketId;

pub use delivery::{DeliveryChannel, DeliveryError, DeliveryReceipt, HttpDeliveryChannel};
pub use queue::{FlushObserver, FlushOutcome, FlushStatus, OutboundQueue};
pub use storage::{FileStore, KeyValueStore, MemoryStore, QueueStorage, StorageError};

/// A message waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOutboundMessage {
    /// Client-side id, stable across restarts
    pub local_id: Uuid,
    pub ticket_id: TicketId,
    pub body: String,
    /// Whether the server should notify the other party
    pub notify: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PendingOutboundMessage {
    pub fn new(ticket_id: TicketId, body: impl Into<String>, notify: bool) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            ticket_id,
            body: body.into(),
            notify,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
