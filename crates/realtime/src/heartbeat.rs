//! Connection liveness tracking
//!
//! Proxies can hold a socket half-open indefinitely without the transport ever
//! reporting a close, so the connection is also judged by how long it has been
//! since any valid inbound envelope arrived.

use std::time::Duration;
use tokio::time::Instant;

/// What the connection should do on a heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a keepalive envelope
    SendKeepalive,
    /// No inbound traffic for longer than the staleness window
    Stale { silent_for: Duration },
}

/// Liveness state for one open connection
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    stale_after: Duration,
    last_activity: Instant,
    next_tick: Instant,
}

impl HeartbeatMonitor {
    /// Start monitoring a connection that opened at `now`
    pub fn start(interval: Duration, stale_after: Duration, now: Instant) -> Self {
        Self {
            interval,
            stale_after,
            last_activity: now,
            next_tick: now + interval,
        }
    }

    /// Record a valid inbound envelope
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// When the next tick is due
    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// Run one tick and schedule the next one
    pub fn tick(&mut self, now: Instant) -> HeartbeatAction {
        self.next_tick = now + self.interval;

        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for > self.stale_after {
            tracing::warn!(
                silent_for_ms = silent_for.as_millis() as u64,
                stale_after_ms = self.stale_after.as_millis() as u64,
                "No inbound traffic within staleness window"
            );
            HeartbeatAction::Stale { silent_for }
        } else {
            HeartbeatAction::SendKeepalive
        }
    }
}
