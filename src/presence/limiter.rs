//! Per-connection inbound rate limiting
//!
//! Fixed-window counter: the window resets once it has fully elapsed, so a
//! burst straddling a boundary can briefly reach twice the nominal rate.
//! That is accepted behavior for this limiter, not a defect.

use std::time::{Duration, Instant};

/// Length of one rate window
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_millis(10_000);

/// Messages admitted per window before the connection is closed
pub const MAX_MESSAGES_PER_WINDOW: u32 = 20;

/// Decision for one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Process the frame
    Admitted,
    /// Close the connection with code 1008; no further frames are processed
    Rejected,
}

impl RateDecision {
    /// Whether the frame was rejected
    pub fn is_rejected(self) -> bool {
        self == RateDecision::Rejected
    }
}

/// Rate state for a single connection
///
/// Owned by the connection's session task; inbound frames for one connection
/// are processed sequentially, so no synchronization is needed.
#[derive(Debug, Clone)]
pub struct RateWindow {
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    /// Create a fresh window starting at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Count one inbound frame against the current window
    pub fn admit(&mut self, now: Instant) -> RateDecision {
        if now.duration_since(self.window_start) > RATE_LIMIT_WINDOW {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        if self.count > MAX_MESSAGES_PER_WINDOW {
            RateDecision::Rejected
        } else {
            RateDecision::Admitted
        }
    }

    /// Frames counted in the current window
    pub fn count(&self) -> u32 {
        self.count
    }
}
