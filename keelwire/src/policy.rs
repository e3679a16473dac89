// Connection upkeep clocks: heartbeat liveness and scheduled rekeys.
//
// Both clocks are polled from the owner's periodic check; they never spawn
// timers of their own.

use std::time::{Duration, Instant};

/// What the heartbeat clock wants done after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendHeartbeat,
    Failed,
}

/// Client-side heartbeat schedule and liveness check.
///
/// A reply gap beyond twice the interval normally fails the connection.
/// The exception is a matching gap between our own polls: that means the
/// host slept, not that the peer died, so the reply clock resets silently.
#[derive(Debug)]
pub struct HeartbeatClock {
    last_sent: Instant,
    last_reply: Instant,
    last_poll: Instant,
}

impl HeartbeatClock {
    pub fn new(now: Instant) -> Self {
        Self {
            last_sent: now,
            last_reply: now,
            last_poll: now,
        }
    }

    /// Record that a heartbeat went out.
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Record a heartbeat reply from the peer.
    pub fn mark_reply(&mut self, now: Instant) {
        self.last_reply = now;
    }

    pub fn poll(&mut self, now: Instant, interval: Duration) -> HeartbeatAction {
        let liveness_window = interval * 2;

        let poll_gap = now.saturating_duration_since(self.last_poll);
        self.last_poll = now;
        if poll_gap > liveness_window {
            // Host sleep: the peer had no chance to answer.
            self.last_sent = now;
            self.last_reply = now;
            return HeartbeatAction::Idle;
        }

        if now.saturating_duration_since(self.last_reply) > liveness_window {
            return HeartbeatAction::Failed;
        }

        if now.saturating_duration_since(self.last_sent) >= interval {
            return HeartbeatAction::SendHeartbeat;
        }

        HeartbeatAction::Idle
    }
}

/// Tracks when the next scheduled rekey is due.
#[derive(Debug)]
pub struct RekeyClock {
    last: Instant,
}

impl RekeyClock {
    pub fn new(now: Instant) -> Self {
        Self { last: now }
    }

    pub fn due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last) >= interval
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = now;
    }
}
