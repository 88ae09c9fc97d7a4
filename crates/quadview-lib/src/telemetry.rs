//! Rolling-window throughput reporting.

use std::fmt;
use std::time::{Duration, Instant};

/// Reporting window for continuous decode sessions.
pub const DECODE_WINDOW: Duration = Duration::from_secs(10);

/// Reporting window for still-image pollers.
pub const SNAPSHOT_WINDOW: Duration = Duration::from_secs(5);

/// Active decode path, reported alongside frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Hardware,
    Software,
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeMode::Hardware => write!(f, "vaapi"),
            DecodeMode::Software => write!(f, "software"),
        }
    }
}

/// Frame counter over a fixed reporting window.
pub struct RateWindow {
    window: Duration,
    count: u64,
    opened: Instant,
}

/// One completed window: how many frames over how long.
pub struct RateReport {
    pub frames: u64,
    pub elapsed: Duration,
}

impl RateReport {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self::opened_at(window, Instant::now())
    }

    pub fn opened_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            count: 0,
            opened: now,
        }
    }

    /// Counts one frame. When the window has elapsed, returns its report
    /// and starts the next window at `now`.
    pub fn record(&mut self, now: Instant) -> Option<RateReport> {
        self.count += 1;
        let elapsed = now.duration_since(self.opened);
        if elapsed < self.window {
            return None;
        }

        let report = RateReport {
            frames: self.count,
            elapsed,
        };
        self.count = 0;
        self.opened = now;
        Some(report)
    }
}
