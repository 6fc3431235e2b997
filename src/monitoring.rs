//! In this module, we implement all the monitoring logic for the streaming loop:
//! how far behind real time the processing is, and whether the consumer keeps up
//! with the slots we publish. Both are advisory, nothing here ever throttles.

use std::time::{Duration, Instant};

/// How often the lag notice may repeat
pub const LAG_NOTICE_INTERVAL: Duration = Duration::from_secs(15);

/// Compares processed data time with wall time
#[derive(Debug)]
pub struct LagMonitor {
    start: Instant,
    last_notice: Instant,
    interval: Duration,
    // Acquisition time covered by the windows done so far
    expected: Duration,
    windows: u64,
}

impl LagMonitor {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(start: Instant, interval: Duration) -> Self {
        Self {
            start,
            last_notice: start,
            interval,
            expected: Duration::ZERO,
            windows: 0,
        }
    }

    pub fn windows(&self) -> u64 {
        self.windows
    }

    /// Record a finished window covering `window` of acquisition time.
    /// Returns the lag if it is time to tell someone about it.
    pub fn window_done(&mut self, window: Duration, now: Instant) -> Option<Duration> {
        self.windows += 1;
        self.expected += window;
        let elapsed = now.saturating_duration_since(self.start);
        let lag = elapsed.checked_sub(self.expected)?;
        if lag > Duration::ZERO && now.saturating_duration_since(self.last_notice) > self.interval {
            self.last_notice = now;
            Some(lag)
        } else {
            None
        }
    }
}

/// Reports a consumer overflow once, then stays quiet until the consumer has caught up
#[derive(Debug, Default)]
pub struct OverflowLatch {
    overflowing: bool,
    occurrences: u64,
}

impl OverflowLatch {
    /// `behind` is how many published slots the consumer has not read yet.
    /// Returns true when a new overflow should be reported.
    pub fn observe(&mut self, behind: u64, capacity: usize) -> bool {
        if behind >= capacity as u64 {
            if self.overflowing {
                false
            } else {
                self.overflowing = true;
                self.occurrences += 1;
                true
            }
        } else {
            self.overflowing = false;
            false
        }
    }

    pub fn is_overflowing(&self) -> bool {
        self.overflowing
    }

    /// Distinct overflows seen so far
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    pub fn reset(&mut self) {
        self.overflowing = false;
    }
}
