//! Request/response delivery for queued messages

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::Url;

use plexmcp_shared::{ApiErrorBody, ApiErrorDetail, MessageId, PlexError, ReplyToTicketRequest, TicketMessage};

use super::PendingOutboundMessage;

/// Timeout for a single delivery request (15 seconds)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Retries for transient failures within one delivery call
const MAX_RETRIES: usize = 2;

/// Initial backoff duration for retries (100ms)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff duration for retries (2 seconds)
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Server acknowledgement of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Server-assigned id, also used to suppress the push echo
    pub message_id: MessageId,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    #[error("Rejected with HTTP {status}: {error}")]
    Rejected { status: u16, error: PlexError },

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Delivery channel unavailable: {0}")]
    Unavailable(String),
}

impl DeliveryError {
    /// Returns true if the message should stay queued and be retried later
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Http(_) => true,
            DeliveryError::Server { .. } => true,
            DeliveryError::Unavailable(_) => true,
            // The server may have stored the message; retrying risks a duplicate, not a loss
            DeliveryError::InvalidResponse => true,

            DeliveryError::Rejected { .. } => false,
        }
    }
}

/// Durable path used to flush the outbound queue
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, message: &PendingOutboundMessage) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Delivers queued messages through the ticket reply endpoint
pub struct HttpDeliveryChannel {
    http_client: Client,
    api_url: String,
    access_token: Option<String>,
}

impl HttpDeliveryChannel {
    #[allow(clippy::expect_used)] // HTTP client creation failure is a fatal system error
    pub fn new(api_url: &Url, access_token: Option<String>) -> Self {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            api_url: api_url.as_str().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn endpoint(&self, message: &PendingOutboundMessage) -> String {
        format!(
            "{}/api/v1/support/tickets/{}/messages",
            self.api_url, message.ticket_id
        )
    }

    async fn post_once(&self, message: &PendingOutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        let body = ReplyToTicketRequest {
            content: message.body.clone(),
            notify: message.notify,
        };

        let mut request = self.http_client.post(self.endpoint(message)).json(&body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            let reply: TicketMessage = response
                .json()
                .await
                .map_err(|_| DeliveryError::InvalidResponse)?;
            return Ok(DeliveryReceipt {
                message_id: reply.id,
            });
        }

        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            return Err(DeliveryError::Server {
                status: status.as_u16(),
            });
        }

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ApiErrorBody>(&text).unwrap_or_else(|_| ApiErrorBody {
            error: ApiErrorDetail {
                code: "UNKNOWN".to_string(),
                message: status.canonical_reason().unwrap_or("request rejected").to_string(),
            },
        });

        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            error: PlexError::from_api(status.as_u16(), &body),
        })
    }
}

#[async_trait]
impl DeliveryChannel for HttpDeliveryChannel {
    /// Only transient errors are retried; rejections are returned immediately.
    async fn deliver(&self, message: &PendingOutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.post_once(message).await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        ticket_id = %message.ticket_id,
                        local_id = %message.local_id,
                        error = %e,
                        "Transient delivery error - will retry"
                    );
                    Err(result)
                }
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }
}
