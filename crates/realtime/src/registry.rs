//! Subscription registry for inbound fan-out
//!
//! Handlers are registered per ticket and per event category (messages, typing,
//! status), plus a global list for connection events. Each registration returns a
//! [`Subscription`] that removes exactly that entry, by token, when disposed.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use plexmcp_shared::TicketId;

use crate::events::{ChatMessage, StatusUpdate, TypingIndicator};
use crate::state::ConnectionEvent;

/// Callback invoked with an event payload
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifies one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

/// Where a handler is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Messages(TicketId),
    Typing(TicketId),
    Status(TicketId),
    Global,
}

/// Ordered handler lists keyed by `K`
struct HandlerTable<K, T> {
    entries: Mutex<HashMap<K, Vec<(HandlerToken, Handler<T>)>>>,
}

impl<K: Eq + Hash + Copy, T> HandlerTable<K, T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Vec<(HandlerToken, Handler<T>)>>> {
        // A handler panic never happens while the lock is held
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, key: K, token: HandlerToken, handler: Handler<T>) -> usize {
        let mut entries = self.lock();
        let list = entries.entry(key).or_default();
        list.push((token, handler));
        list.len()
    }

    fn remove(&self, key: &K, token: HandlerToken) -> bool {
        let mut entries = self.lock();
        let Some(list) = entries.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(t, _)| *t != token);
        let removed = list.len() < before;

        // Clean up empty lists
        if list.is_empty() {
            entries.remove(key);
        }
        removed
    }

    fn contains(&self, key: &K, token: HandlerToken) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|list| list.iter().any(|(t, _)| *t == token))
    }

    fn snapshot(&self, key: &K) -> Vec<(HandlerToken, Handler<T>)> {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    fn len(&self, key: &K) -> usize {
        self.lock().get(key).map(|list| list.len()).unwrap_or(0)
    }

    /// Invoke handlers registered under `key` in registration order
    ///
    /// Handlers run outside the lock so they may subscribe or dispose. Each one is
    /// re-checked right before invocation, so a handler disposed by an earlier
    /// handler in the same dispatch is skipped.
    fn dispatch(&self, key: &K, topic: Topic, payload: &T) -> usize {
        let mut invoked = 0;
        for (token, handler) in self.snapshot(key) {
            if !self.contains(key, token) {
                continue;
            }
            invoked += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                tracing::error!(
                    topic = ?topic,
                    panic = %panic_message(panic.as_ref()),
                    "Subscriber handler panicked"
                );
            }
        }
        invoked
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fan-out of inbound events to registered handlers
pub struct SubscriptionRegistry {
    next_token: AtomicU64,
    messages: HandlerTable<TicketId, ChatMessage>,
    typing: HandlerTable<TicketId, TypingIndicator>,
    status: HandlerTable<TicketId, StatusUpdate>,
    global: HandlerTable<(), ConnectionEvent>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_token: AtomicU64::new(1),
            messages: HandlerTable::new(),
            typing: HandlerTable::new(),
            status: HandlerTable::new(),
            global: HandlerTable::new(),
        })
    }

    fn token(&self) -> HandlerToken {
        HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn subscription(self: &Arc<Self>, topic: Topic, token: HandlerToken, count: usize) -> Subscription {
        tracing::debug!(topic = ?topic, handlers = count, "Handler subscribed");
        Subscription {
            registry: Arc::downgrade(self),
            topic,
            token,
        }
    }

    /// Receive chat messages pushed for a ticket
    pub fn subscribe_messages<F>(self: &Arc<Self>, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        let token = self.token();
        let count = self.messages.add(ticket_id, token, Arc::new(handler));
        self.subscription(Topic::Messages(ticket_id), token, count)
    }

    /// Receive typing indicators for a ticket
    pub fn subscribe_typing<F>(self: &Arc<Self>, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: Fn(&TypingIndicator) + Send + Sync + 'static,
    {
        let token = self.token();
        let count = self.typing.add(ticket_id, token, Arc::new(handler));
        self.subscription(Topic::Typing(ticket_id), token, count)
    }

    /// Receive delivery/read status updates for a ticket
    pub fn subscribe_status<F>(self: &Arc<Self>, ticket_id: TicketId, handler: F) -> Subscription
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        let token = self.token();
        let count = self.status.add(ticket_id, token, Arc::new(handler));
        self.subscription(Topic::Status(ticket_id), token, count)
    }

    /// Receive connection events
    pub fn subscribe_global<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let token = self.token();
        let count = self.global.add((), token, Arc::new(handler));
        self.subscription(Topic::Global, token, count)
    }

    fn remove(&self, topic: Topic, token: HandlerToken) -> bool {
        let removed = match topic {
            Topic::Messages(ticket_id) => self.messages.remove(&ticket_id, token),
            Topic::Typing(ticket_id) => self.typing.remove(&ticket_id, token),
            Topic::Status(ticket_id) => self.status.remove(&ticket_id, token),
            Topic::Global => self.global.remove(&(), token),
        };
        if removed {
            tracing::debug!(topic = ?topic, "Handler disposed");
        }
        removed
    }

    pub fn dispatch_message(&self, message: &ChatMessage) -> usize {
        let ticket_id = message.ticket_id;
        self.messages
            .dispatch(&ticket_id, Topic::Messages(ticket_id), message)
    }

    pub fn dispatch_typing(&self, typing: &TypingIndicator) -> usize {
        let ticket_id = typing.ticket_id;
        self.typing.dispatch(&ticket_id, Topic::Typing(ticket_id), typing)
    }

    pub fn dispatch_status(&self, update: &StatusUpdate) -> usize {
        let ticket_id = update.ticket_id;
        self.status.dispatch(&ticket_id, Topic::Status(ticket_id), update)
    }

    pub fn dispatch_global(&self, event: &ConnectionEvent) -> usize {
        self.global.dispatch(&(), Topic::Global, event)
    }

    /// Number of handlers registered for a topic
    pub fn handler_count(&self, topic: Topic) -> usize {
        match topic {
            Topic::Messages(ticket_id) => self.messages.len(&ticket_id),
            Topic::Typing(ticket_id) => self.typing.len(&ticket_id),
            Topic::Status(ticket_id) => self.status.len(&ticket_id),
            Topic::Global => self.global.len(&()),
        }
    }
}

/// Handle that removes one handler registration
#[must_use = "the subscription handle is the only way to remove the handler"]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    topic: Topic,
    token: HandlerToken,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Remove the handler
    ///
    /// Once this returns the handler is not invoked for any event dispatched
    /// afterwards.
    pub fn dispose(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.topic, self.token);
        }
    }
}
