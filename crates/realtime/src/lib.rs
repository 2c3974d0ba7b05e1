//! PlexMCP Realtime Client
//!
//! Keeps a persistent connection to the PlexMCP support socket, recovers from
//! connection loss, queues outbound messages while disconnected, and fans inbound
//! events out to per-ticket subscribers.
//!
//! # Architecture
//!
//! - **Connection**: background task owning the transport, timers and state machine
//! - **Events**: typed wire envelopes and the text-frame codec
//! - **Heartbeat / Reconnect**: liveness tracking and backoff scheduling
//! - **Outbound**: durable per-ticket queue flushed over HTTP
//! - **Registry / Dedup**: subscriber fan-out and push-echo suppression

pub mod client;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod outbound;
pub mod reconnect;
pub mod registry;
pub mod state;
pub mod transport;

pub use client::{ClientDeps, Identity, RealtimeClient, SendOutcome};
pub use config::{ConfigError, RealtimeConfig};
pub use connection::StatusSnapshot;
pub use error::{CodecError, FailureClass, RealtimeError, RealtimeResult};
pub use events::{ChatMessage, Envelope, EnvelopeBody, EnvelopeKind, StatusUpdate, TypingIndicator};
pub use outbound::{DeliveryChannel, DeliveryError, DeliveryReceipt, PendingOutboundMessage};
pub use registry::{Subscription, SubscriptionRegistry, Topic};
pub use state::{ConnectionEvent, ConnectionState, StatusReason};
pub use transport::{Connector, TransportCommand, TransportError, TransportEvent, TransportHandle};
