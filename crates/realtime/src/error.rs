//! Realtime client error types and failure classification

use crate::config::ConfigError;
use crate::outbound::storage::StorageError;

/// Normal closure, the only code a client-initiated close uses
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Application close codes the server uses when it rejects the identity
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;

/// Errors returned from the public client API
///
/// Connection-level failures are never returned here; they are reported through
/// `ConnectionEvent`s on the global subscription.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("Connection is not open")]
    NotConnected,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Client has been shut down")]
    ClientClosed,

    #[error("Client identity is already set to a different subject")]
    IdentityMismatch,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for realtime client operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Errors raised while encoding or decoding wire frames
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Frame has no type tag")]
    MissingKind,

    #[error("Unrecognized frame type: {0}")]
    UnknownKind(String),

    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// How a connection-level failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Dropped connection or transport error; retried with backoff
    Transient,
    /// Connect attempt exceeded the connect timeout
    Timeout,
    /// Server reported a protocol violation; retried with backoff
    Protocol,
    /// Server rejected the identity; never retried automatically
    Fatal,
}

impl FailureClass {
    /// Classify a close code received from the server
    pub fn from_close_code(code: u16) -> Self {
        match code {
            CLOSE_PROTOCOL_ERROR | CLOSE_UNSUPPORTED_DATA | CLOSE_INVALID_PAYLOAD => {
                FailureClass::Protocol
            }
            CLOSE_POLICY_VIOLATION | CLOSE_UNAUTHORIZED | CLOSE_FORBIDDEN => FailureClass::Fatal,
            _ => FailureClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Fatal)
    }
}
