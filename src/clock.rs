//! Time source used to timestamp and pace bus traffic

use std::time::{Duration, Instant};

/// Monotonic time source. All packet timestamps and listening windows
/// are measured against the same clock
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's epoch
    fn now(&self) -> Duration;
}

/// Wall clock backed by [Instant]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Creates a clock whose epoch is now
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}
