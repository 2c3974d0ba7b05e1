//! Tail a support ticket over the realtime socket
//!
//! Usage:
//!   plexmcp-realtime <ticket-id> [message...]
//!
//! Reads `REALTIME_*` settings from the environment (or `.env`), plus
//! `REALTIME_SUBJECT_ID` and `REALTIME_SUBJECT_ROLE` for the identity. Logs every
//! event for the ticket until Ctrl-C. Set `LOG_FORMAT=json` for JSON logs.

use std::env;

use anyhow::{bail, Context};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use plexmcp_realtime::{ConnectionEvent, Identity, RealtimeClient, RealtimeConfig, SendOutcome};
use plexmcp_shared::{SubjectRole, TicketId, UserId};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("plexmcp_realtime=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        let _ = registry.with(tracing_subscriber::fmt::layer().json()).try_init();
    } else {
        let _ = registry.with(tracing_subscriber::fmt::layer()).try_init();
    }
}

fn identity_from_env() -> anyhow::Result<Identity> {
    let subject_id = env::var("REALTIME_SUBJECT_ID").context("REALTIME_SUBJECT_ID is not set")?;
    let subject_id = Uuid::parse_str(&subject_id).context("REALTIME_SUBJECT_ID is not a UUID")?;
    let role = env::var("REALTIME_SUBJECT_ROLE").unwrap_or_else(|_| "user".to_string());
    let role: SubjectRole = role.parse().map_err(anyhow::Error::msg)?;

    Ok(Identity::new(UserId(subject_id), role))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let mut args = env::args().skip(1);
    let Some(ticket_arg) = args.next() else {
        bail!("usage: plexmcp-realtime <ticket-id> [message...]");
    };
    let ticket_id = TicketId(Uuid::parse_str(&ticket_arg).context("ticket id is not a UUID")?);
    let message = args.collect::<Vec<_>>().join(" ");

    let config = RealtimeConfig::from_env().context("failed to load realtime configuration")?;
    let identity = identity_from_env()?;
    let client = RealtimeClient::from_config(config).context("failed to start realtime client")?;

    let subscriptions = vec![
        client.subscribe_global(|event| match event {
            ConnectionEvent::StatusChanged { state, reason, .. } => {
                tracing::info!(state = ?state, reason = %reason, "Connection status");
            }
            ConnectionEvent::RetriesExhausted { attempts } => {
                tracing::error!(attempts, "Giving up on automatic reconnects");
            }
            other => tracing::debug!(event = ?other, "Connection event"),
        }),
        client.subscribe_messages(ticket_id, |message| {
            tracing::info!(
                sender = ?message.sender_id,
                sender_type = %message.sender_type,
                content = %message.content,
                "Message"
            );
        }),
        client.subscribe_typing(ticket_id, |typing| {
            tracing::info!(sender = %typing.sender_id, is_typing = typing.is_typing, "Typing");
        }),
        client.subscribe_status(ticket_id, |update| {
            tracing::info!(message_id = %update.message_id, status = update.status.as_str(), "Status");
        }),
    ];

    client.init(identity).await?;

    if !message.is_empty() {
        match client.send_message(ticket_id, message, true).await? {
            SendOutcome::Sent => tracing::info!("Message sent"),
            SendOutcome::Queued(local_id) => {
                tracing::info!(local_id = %local_id, "Not connected yet - message queued")
            }
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!(pending = client.pending_count(), "Shutting down");

    for subscription in subscriptions {
        subscription.dispose();
    }
    client.disconnect().await;
    client.shutdown().await;

    Ok(())
}
