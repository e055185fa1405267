use super::TickClock;
use std::time::{Duration, Instant};

/// Nanosecond ticks since construction, backed by `Instant`.
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        HostClock { origin: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for HostClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn ticks_per_second(&self) -> u64 {
        1_000_000_000
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Deadline;

    #[test]
    fn test_host_clock_advances() {
        let mut clock = HostClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.now() - start >= 2_000_000);
    }

    #[test]
    fn test_host_deadline() {
        let mut clock = HostClock::new();
        let deadline = Deadline::after(&clock, Duration::from_millis(200));
        assert!(!deadline.is_due(&clock));
        clock.sleep(Duration::from_millis(210));
        assert!(deadline.is_due(&clock));
    }
}
