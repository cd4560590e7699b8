//! System time adapter.
//!
//! Event timestamps are wall-clock seconds since the Unix epoch; the
//! supervisor is expected to have brought up time sync (SNTP on device)
//! before the agent starts emitting events.  `std::time::SystemTime` is
//! backed by the newlib RTC on ESP-IDF and the OS clock on the host, so a
//! single implementation serves both targets.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::app::ports::TimeSource;

/// Wall-clock and uptime source for the agent.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Seconds since this clock was created (monotonic).
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemClock {
    fn epoch_secs(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            // Clock before the epoch means time sync never happened;
            // report zero rather than panicking in an event path.
            Err(_) => 0,
        }
    }
}
