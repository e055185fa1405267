//! Monotonic tick clocks and deadline arithmetic.
//!
//! A hosted build counts nanoseconds on a clock that never wraps; small
//! targets count milliseconds on a counter that wraps at some period. Both
//! go through the same add/diff helpers so deadline comparisons stay correct
//! across a wrap.

mod host;

pub use host::HostClock;

use std::time::Duration;

pub trait TickClock {
    /// Current tick count.
    fn now(&self) -> u64;

    fn ticks_per_second(&self) -> u64;

    /// Wrap modulus of the tick counter, `None` when it never wraps.
    fn period(&self) -> Option<u64> {
        None
    }

    fn sleep(&mut self, duration: Duration);

    /// Convert a duration to clock ticks.
    fn ticks_for(&self, duration: Duration) -> u64 {
        (duration.as_nanos() * self.ticks_per_second() as u128 / 1_000_000_000) as u64
    }
}

/// `base + delta`, wrapped to the clock period.
pub fn ticks_add(base: u64, delta: u64, period: Option<u64>) -> u64 {
    match period {
        Some(p) => ((base as u128 + delta as u128) % p as u128) as u64,
        None => base.wrapping_add(delta),
    }
}

/// Signed `a - b`. With a period `P` the result lies in `[-P/2, P/2)`.
pub fn ticks_diff(a: u64, b: u64, period: Option<u64>) -> i64 {
    match period {
        Some(p) => {
            let p = p as i128;
            let half = p / 2;
            ((a as i128 - b as i128 + half).rem_euclid(p) - half) as i64
        }
        None => a.wrapping_sub(b) as i64,
    }
}

/// A point in clock ticks after which some periodic job is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: u64,
}

impl Deadline {
    pub fn after<C: TickClock + ?Sized>(clock: &C, delay: Duration) -> Self {
        Deadline {
            at: ticks_add(clock.now(), clock.ticks_for(delay), clock.period()),
        }
    }

    pub fn is_due<C: TickClock + ?Sized>(&self, clock: &C) -> bool {
        ticks_diff(clock.now(), self.at, clock.period()) >= 0
    }

    /// Move the deadline to `now + delay`.
    pub fn reschedule<C: TickClock + ?Sized>(&mut self, clock: &C, delay: Duration) {
        *self = Deadline::after(clock, delay);
    }

    pub fn at(&self) -> u64 {
        self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Millisecond counter that wraps at 2^30, like small-target tick APIs
    struct WrappingClock {
        now: u64,
    }

    const PERIOD: u64 = 1 << 30;

    impl TickClock for WrappingClock {
        fn now(&self) -> u64 {
            self.now
        }
        fn ticks_per_second(&self) -> u64 {
            1000
        }
        fn period(&self) -> Option<u64> {
            Some(PERIOD)
        }
        fn sleep(&mut self, duration: Duration) {
            let ticks = self.ticks_for(duration);
            self.now = ticks_add(self.now, ticks, self.period());
        }
    }

    #[test]
    fn test_unwrapped_add_and_diff() {
        assert_eq!(ticks_add(10, 5, None), 15);
        assert_eq!(ticks_diff(15, 10, None), 5);
        assert_eq!(ticks_diff(10, 15, None), -5);
    }

    #[test]
    fn test_wrapped_add_and_diff() {
        let near_end = PERIOD - 100;
        let later = ticks_add(near_end, 250, Some(PERIOD));
        assert_eq!(later, 150);
        assert_eq!(ticks_diff(later, near_end, Some(PERIOD)), 250);
        assert_eq!(ticks_diff(near_end, later, Some(PERIOD)), -250);
    }

    #[test]
    fn test_deadline_survives_wrap() {
        let mut clock = WrappingClock { now: PERIOD - 500 };
        let deadline = Deadline::after(&clock, Duration::from_secs(1));
        assert_eq!(deadline.at(), 500);
        assert!(!deadline.is_due(&clock));

        clock.sleep(Duration::from_millis(999));
        assert!(!deadline.is_due(&clock));
        clock.sleep(Duration::from_millis(1));
        assert!(deadline.is_due(&clock));
        clock.sleep(Duration::from_millis(5000));
        assert!(deadline.is_due(&clock));
    }

    #[test]
    fn test_ticks_for_scales_by_rate() {
        let clock = WrappingClock { now: 0 };
        assert_eq!(clock.ticks_for(Duration::from_secs(10)), 10_000);
        assert_eq!(clock.ticks_for(Duration::from_micros(1500)), 1);
    }
}
