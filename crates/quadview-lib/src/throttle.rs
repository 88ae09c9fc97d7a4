//! Consumer hand-off rate limiting.

use std::time::{Duration, Instant};

/// Admits at most one push per interval. Frames arriving inside the
/// interval are not delivered at all, so the next admitted frame is always
/// the most recent one. Decoding never waits on this.
pub struct PushThrottle {
    interval: Duration,
    last_push: Option<Instant>,
}

impl PushThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_push: None,
        }
    }

    /// True when enough time has passed since the previous admitted push.
    /// An admitted call marks `now` as the new reference point.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last_push {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_push = Some(now);
                true
            }
        }
    }
}
