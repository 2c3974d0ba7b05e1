//! Transport abstraction and the WebSocket implementation
//!
//! The connection task only ever sees a [`TransportHandle`]: a command sender and
//! an event receiver. [`WebSocketConnector`] backs it with tokio-tungstenite by
//! splitting the socket and pumping each half from its own task.

use async_trait::async_trait;
use futures::{stream::StreamExt, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use crate::client::Identity;
use crate::error::{FailureClass, CLOSE_ABNORMAL};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Server rejected the connection: HTTP {status}")]
    Rejected { status: u16 },

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Invalid transport URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Rejected { .. } | TransportError::InvalidUrl(_) => FailureClass::Fatal,
            TransportError::Connect(_) => FailureClass::Transient,
        }
    }
}

/// Instructions for an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Text(String),
    Close(u16),
}

/// Events an open transport reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: u16, reason: String },
    Error(String),
}

impl TransportEvent {
    /// What the connection task assumes when the event stream ends without a close frame
    pub fn dropped() -> Self {
        TransportEvent::Closed {
            code: CLOSE_ABNORMAL,
            reason: "connection dropped".to_string(),
        }
    }
}

/// An open transport
#[derive(Debug)]
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<TransportCommand>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// Build a handle plus the far ends of both channels
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<TransportCommand>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: cmd_tx,
                inbound: event_rx,
            },
            cmd_rx,
            event_tx,
        )
    }
}

/// Opens transports to the realtime server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<TransportHandle, TransportError>;
}

/// Build the connection URL for an identity
///
/// `http`/`https` bases are mapped to `ws`/`wss`. `t` is a cache-busting
/// timestamp in unix milliseconds.
pub fn build_transport_url(
    base: &Url,
    identity: &Identity,
    access_token: Option<&str>,
    unix_ms: i128,
) -> Result<Url, TransportError> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(base.to_string()))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("subjectId", &identity.subject_id.to_string())
            .append_pair("subjectRole", identity.subject_role.as_str())
            .append_pair("t", &unix_ms.to_string());
        if let Some(token) = access_token {
            query.append_pair("token", token);
        }
    }

    Ok(url)
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<TransportHandle, TransportError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => TransportError::Rejected {
                    status: response.status().as_u16(),
                },
                tungstenite::Error::Url(e) => TransportError::InvalidUrl(e.to_string()),
                other => TransportError::Connect(other.to_string()),
            })?;

        let (mut sender, mut receiver) = socket.split();
        let (handle, mut cmd_rx, event_tx) = TransportHandle::pair();

        // Spawn task to write commands to the server
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                match command {
                    TransportCommand::Text(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break; // Connection closed
                        }
                    }
                    TransportCommand::Close(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        let _ = sender.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = sender.close().await;
        });

        // Spawn task to forward server frames
        tokio::spawn(async move {
            while let Some(frame) = receiver.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Text(text),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((CLOSE_ABNORMAL, String::new()));
                        let _ = event_tx.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Ok(_) => continue, // Ping/pong are answered by tungstenite; binary is unused
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                };
                if event_tx.send(event).is_err() {
                    break; // Handle dropped
                }
            }
        });

        Ok(handle)
    }
}
