//! Per-ticket FIFO of messages awaiting delivery

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use uuid::Uuid;

use plexmcp_shared::TicketId;

use super::delivery::{DeliveryChannel, DeliveryError, DeliveryReceipt};
use super::storage::{QueueStorage, StorageError};
use super::PendingOutboundMessage;

/// How a flush of one ticket ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Every message was delivered or permanently rejected
    Drained,
    /// A transient failure stopped the flush; the message kept its position
    Stalled,
    /// Another flush of this ticket was already running
    Coalesced,
}

/// Result of flushing one ticket
#[derive(Debug)]
pub struct FlushOutcome {
    pub ticket_id: TicketId,
    pub status: FlushStatus,
    pub delivered: Vec<(PendingOutboundMessage, DeliveryReceipt)>,
    pub rejected: Vec<(PendingOutboundMessage, DeliveryError)>,
    /// Messages still queued for the ticket when the flush ended
    pub remaining: usize,
}

impl FlushOutcome {
    fn new(ticket_id: TicketId, status: FlushStatus) -> Self {
        Self {
            ticket_id,
            status,
            delivered: Vec::new(),
            rejected: Vec::new(),
            remaining: 0,
        }
    }
}

/// Notified as each queued message settles, while the flush is still running
///
/// `remaining` is the ticket's pending count right after the message left the queue.
pub trait FlushObserver: Send + Sync {
    fn delivered(&self, message: &PendingOutboundMessage, receipt: &DeliveryReceipt, remaining: usize);

    fn rejected(&self, message: &PendingOutboundMessage, error: &DeliveryError, remaining: usize);
}

/// Observer that ignores every outcome
impl FlushObserver for () {
    fn delivered(&self, _: &PendingOutboundMessage, _: &DeliveryReceipt, _: usize) {}

    fn rejected(&self, _: &PendingOutboundMessage, _: &DeliveryError, _: usize) {}
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<TicketId, VecDeque<PendingOutboundMessage>>,
    flushing: HashSet<TicketId>,
}

/// Outbound queue shared by the client handle and its connection task
#[derive(Clone)]
pub struct OutboundQueue {
    state: Arc<Mutex<QueueState>>,
    storage: QueueStorage,
}

/// Clears the flush-in-progress flag even if the flush future is dropped
struct FlushGuard<'a> {
    queue: &'a OutboundQueue,
    ticket_id: TicketId,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.queue.lock().flushing.remove(&self.ticket_id);
    }
}

impl OutboundQueue {
    /// Build the queue from whatever was persisted by a previous run
    pub fn restore(storage: QueueStorage) -> Result<Self, StorageError> {
        let mut state = QueueState::default();
        let mut restored = 0;

        for (ticket_id, messages) in storage.load_all()? {
            restored += messages.len();
            state.pending.insert(ticket_id, messages.into());
        }

        if restored > 0 {
            tracing::info!(
                messages = restored,
                tickets = state.pending.len(),
                "Restored pending outbound messages"
            );
        }

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            storage,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &QueueState, ticket_id: TicketId) -> Result<(), StorageError> {
        let messages: Vec<PendingOutboundMessage> = state
            .pending
            .get(&ticket_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default();
        self.storage.save(ticket_id, &messages)
    }

    /// Append a message and persist the ticket's queue
    ///
    /// On a storage failure the message is not queued and the error is returned.
    /// Returns the number of messages now pending for the ticket.
    pub fn enqueue(&self, message: PendingOutboundMessage) -> Result<usize, StorageError> {
        let ticket_id = message.ticket_id;
        let local_id = message.local_id;
        let mut state = self.lock();

        state.pending.entry(ticket_id).or_default().push_back(message);
        if let Err(e) = self.persist(&state, ticket_id) {
            Self::remove_from(&mut state, ticket_id, local_id);
            tracing::error!(ticket_id = %ticket_id, error = %e, "Failed to persist outbound message");
            return Err(e);
        }

        let pending = state.pending.get(&ticket_id).map_or(0, VecDeque::len);
        tracing::debug!(
            ticket_id = %ticket_id,
            local_id = %local_id,
            pending,
            "Queued outbound message"
        );
        Ok(pending)
    }

    fn remove_from(state: &mut QueueState, ticket_id: TicketId, local_id: Uuid) -> bool {
        let Some(queue) = state.pending.get_mut(&ticket_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|m| m.local_id != local_id);
        let removed = queue.len() < before;
        if queue.is_empty() {
            state.pending.remove(&ticket_id);
        }
        removed
    }

    /// Drop a message from memory and storage after its delivery attempt concluded
    fn settle(&self, ticket_id: TicketId, local_id: Uuid) -> usize {
        let mut state = self.lock();
        if Self::remove_from(&mut state, ticket_id, local_id) {
            if let Err(e) = self.persist(&state, ticket_id) {
                // The message may be redelivered after a restart
                tracing::error!(
                    ticket_id = %ticket_id,
                    local_id = %local_id,
                    error = %e,
                    "Failed to persist outbound queue after delivery"
                );
            }
        }
        state.pending.get(&ticket_id).map_or(0, VecDeque::len)
    }

    /// Pending messages for a ticket, oldest first
    pub fn pending(&self, ticket_id: TicketId) -> Vec<PendingOutboundMessage> {
        self.lock()
            .pending
            .get(&ticket_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pending messages across all tickets
    pub fn pending_count(&self) -> usize {
        self.lock().pending.values().map(VecDeque::len).sum()
    }

    /// Tickets with at least one pending message
    pub fn tickets(&self) -> Vec<TicketId> {
        self.lock().pending.keys().copied().collect()
    }

    /// Deliver a ticket's pending messages in order
    ///
    /// Stops at the first transient failure so later messages never overtake it.
    /// A second flush for a ticket that is already flushing returns
    /// [`FlushStatus::Coalesced`] without doing anything. `observer` hears about
    /// each settled message before the next delivery starts.
    pub async fn flush_ticket(
        &self,
        ticket_id: TicketId,
        channel: &dyn DeliveryChannel,
        observer: &dyn FlushObserver,
    ) -> FlushOutcome {
        if !self.lock().flushing.insert(ticket_id) {
            tracing::debug!(ticket_id = %ticket_id, "Flush already in progress - coalesced");
            return FlushOutcome::new(ticket_id, FlushStatus::Coalesced);
        }
        let _guard = FlushGuard {
            queue: self,
            ticket_id,
        };

        let mut outcome = FlushOutcome::new(ticket_id, FlushStatus::Drained);
        loop {
            let next = self
                .lock()
                .pending
                .get(&ticket_id)
                .and_then(|queue| queue.front().cloned());
            let Some(message) = next else {
                break;
            };

            match channel.deliver(&message).await {
                Ok(receipt) => {
                    let remaining = self.settle(ticket_id, message.local_id);
                    observer.delivered(&message, &receipt, remaining);
                    tracing::debug!(
                        ticket_id = %ticket_id,
                        local_id = %message.local_id,
                        message_id = %receipt.message_id,
                        "Delivered queued message"
                    );
                    outcome.delivered.push((message, receipt));
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        ticket_id = %ticket_id,
                        local_id = %message.local_id,
                        error = %e,
                        "Transient delivery failure - will retry on next flush"
                    );
                    outcome.status = FlushStatus::Stalled;
                    break;
                }
                Err(e) => {
                    let remaining = self.settle(ticket_id, message.local_id);
                    observer.rejected(&message, &e, remaining);
                    tracing::error!(
                        ticket_id = %ticket_id,
                        local_id = %message.local_id,
                        error = %e,
                        "Queued message permanently rejected"
                    );
                    outcome.rejected.push((message, e));
                }
            }
        }

        outcome.remaining = self.lock().pending.get(&ticket_id).map_or(0, VecDeque::len);
        outcome
    }

    /// Flush every ticket with pending messages, tickets concurrently
    pub async fn flush_all(
        &self,
        channel: &dyn DeliveryChannel,
        observer: &dyn FlushObserver,
    ) -> Vec<FlushOutcome> {
        let tickets = self.tickets();
        if tickets.is_empty() {
            return Vec::new();
        }

        tracing::info!(tickets = tickets.len(), pending = self.pending_count(), "Flushing outbound queue");
        join_all(
            tickets
                .into_iter()
                .map(|ticket_id| self.flush_ticket(ticket_id, channel, observer)),
        )
        .await
    }
}
