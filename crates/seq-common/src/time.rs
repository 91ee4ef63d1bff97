//! Monotonic time reference shared by every service of a session.

use std::time::{Duration, Instant};

/// Process-start reference captured once before any service runs.
///
/// Copies are cheap and all compare against the same instant, so event
/// timestamps from different threads share one timebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessClock {
    start: Instant,
}

impl ProcessClock {
    /// Capture the reference instant now.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time elapsed since the reference instant.
    #[inline]
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
