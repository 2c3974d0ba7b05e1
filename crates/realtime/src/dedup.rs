//! Suppression of push echoes for messages already confirmed over HTTP
//!
//! A message sent by this client is observed twice: once as the response to the
//! HTTP send, and once as the server's push echo. Push copies arriving within the
//! window after the HTTP confirmation are dropped; later arrivals with the same
//! id (status changes, read receipts) are delivered normally.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use plexmcp_shared::MessageId;

/// Which category of event an id was confirmed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DedupKind {
    Message,
    Status,
}

/// Recently confirmed ids with the time they were confirmed
#[derive(Debug)]
pub struct DedupGuard {
    window: Duration,
    recently_seen: HashMap<(MessageId, DedupKind), Instant>,
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recently_seen: HashMap::new(),
        }
    }

    /// Record an id confirmed via the HTTP path
    pub fn record_confirmed(&mut self, id: MessageId, kind: DedupKind, now: Instant) {
        self.purge_expired(now);
        self.recently_seen.insert((id, kind), now);
    }

    /// Decide whether a push-delivered envelope should reach subscribers
    pub fn admit_push(&mut self, id: MessageId, kind: DedupKind, now: Instant) -> bool {
        self.purge_expired(now);
        match self.recently_seen.get(&(id, kind)) {
            Some(seen_at) => {
                tracing::debug!(
                    message_id = %id,
                    kind = ?kind,
                    since_confirmed_ms = now.saturating_duration_since(*seen_at).as_millis() as u64,
                    "Dropping push echo of confirmed message"
                );
                false
            }
            None => true,
        }
    }

    /// Entries still inside the window
    pub fn len(&self) -> usize {
        self.recently_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recently_seen.is_empty()
    }

    fn purge_expired(&mut self, now: Instant) {
        let window = self.window;
        self.recently_seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) <= window);
    }
}
