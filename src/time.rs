//! Stream time-base arithmetic.
//!
//! Stream timestamps are integer ticks under a rational time base; engine
//! time is `f64` seconds everywhere else.

use serde::{Deserialize, Serialize};

/// Rational time base: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    /// Millisecond time base, the fallback when a stream declares none.
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };

    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num: num.max(1),
            den: den.max(1),
        }
    }

    /// Convert ticks to seconds.
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.num as f64 / self.den as f64
    }

    /// Convert seconds to ticks, rounding toward negative infinity so that
    /// seek targets never land past the requested position.
    pub fn to_ticks(&self, seconds: f64) -> i64 {
        (seconds * self.den as f64 / self.num as f64).floor() as i64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::MILLIS
    }
}

/// Clamp a tick duration to zero; queues only accumulate non-negative time.
pub fn clamp_ticks(ticks: i64) -> i64 {
    ticks.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_ticks_both_ways() {
        let tb = TimeBase::new(1, 90_000);
        assert_eq!(tb.to_seconds(90_000), 1.0);
        assert_eq!(tb.to_ticks(1.0), 90_000);
        assert_eq!(tb.to_ticks(0.5), 45_000);
    }

    #[test]
    fn zero_denominator_is_sanitized() {
        let tb = TimeBase::new(1, 0);
        assert_eq!(tb.den, 1);
        assert_eq!(tb.to_seconds(3), 3.0);
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        assert_eq!(clamp_ticks(-25), 0);
        assert_eq!(clamp_ticks(25), 25);
    }
}
