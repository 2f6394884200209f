//! Monotonic time source for the dispatch path.
//!
//! Dispatchers and token buckets take `now_ns` explicitly so that they can be
//! driven by simulated time in tests; the controller feeds them this clock.

use std::time::Instant;

/// Nanoseconds elapsed since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct QosClock {
    origin: Instant,
}

impl QosClock {
    /// Starts a clock at zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Returns the current time in nanoseconds.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for QosClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = QosClock::new();
        let a = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = clock.now_ns();
        assert!(b > a);
        assert!(b - a >= 1_000_000);
    }
}
