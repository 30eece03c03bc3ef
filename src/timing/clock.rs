//! Monotonic playback clock with offset and speed ratio.

use std::time::Instant;

/// A pauseable real-time clock.
///
/// `position = offset + elapsed_since_last_rebase * speed_ratio`. Every
/// mutation that would bend the line (speed change, update) first folds the
/// current position into the offset so the position stays continuous.
/// Not internally thread safe; the timing controller serializes access.
#[derive(Debug, Clone)]
pub struct RealTimeClock {
    offset: f64,
    speed_ratio: f64,
    started_at: Option<Instant>,
}

impl RealTimeClock {
    pub fn new() -> Self {
        Self {
            offset: 0.0,
            speed_ratio: 1.0,
            started_at: None,
        }
    }

    /// Current position in seconds.
    pub fn position(&self) -> f64 {
        match self.started_at {
            Some(started) => self.offset + started.elapsed().as_secs_f64() * self.speed_ratio,
            None => self.offset,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Start advancing from the current position.
    pub fn play(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    /// Freeze the position.
    pub fn pause(&mut self) {
        if self.started_at.is_some() {
            self.offset = self.position();
            self.started_at = None;
        }
    }

    /// Zero the offset and stop.
    pub fn reset(&mut self) {
        self.offset = 0.0;
        self.started_at = None;
    }

    /// Re-base at `offset` and run.
    pub fn restart(&mut self, offset: f64) {
        self.offset = offset;
        self.started_at = Some(Instant::now());
    }

    /// Move the clock to `position`, preserving the running state.
    pub fn update(&mut self, position: f64) {
        let was_running = self.started_at.is_some();
        self.offset = position;
        self.started_at = if was_running { Some(Instant::now()) } else { None };
    }

    pub fn speed_ratio(&self) -> f64 {
        self.speed_ratio
    }

    /// Change the advance rate. The offset is re-based first so the
    /// position is continuous across the change.
    pub fn set_speed_ratio(&mut self, ratio: f64) {
        let was_running = self.started_at.is_some();
        self.offset = self.position();
        self.started_at = if was_running { Some(Instant::now()) } else { None };
        self.speed_ratio = ratio.max(0.0);
    }
}

impl Default for RealTimeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn paused_clock_holds_its_position() {
        let mut clock = RealTimeClock::new();
        clock.restart(2.0);
        clock.pause();
        let held = clock.position();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.position(), held);
        assert!(!clock.is_running());
    }

    #[test]
    fn running_clock_advances_monotonically() {
        let mut clock = RealTimeClock::new();
        clock.play();
        let first = clock.position();
        thread::sleep(Duration::from_millis(10));
        let second = clock.position();
        assert!(second >= first);
    }

    #[test]
    fn reset_returns_to_zero_and_stops() {
        let mut clock = RealTimeClock::new();
        clock.restart(5.0);
        clock.reset();
        assert_eq!(clock.position(), 0.0);
        assert!(!clock.is_running());
    }

    #[test]
    fn update_preserves_running_state() {
        let mut clock = RealTimeClock::new();
        clock.update(3.0);
        assert_eq!(clock.position(), 3.0);
        assert!(!clock.is_running());

        clock.play();
        clock.update(1.0);
        assert!(clock.is_running());
        assert!(clock.position() >= 1.0);
    }

    #[test]
    fn speed_change_keeps_position_continuous() {
        let mut clock = RealTimeClock::new();
        clock.restart(1.0);
        thread::sleep(Duration::from_millis(5));
        let before = clock.position();
        clock.set_speed_ratio(2.0);
        let after = clock.position();
        assert!(after >= before);
        assert!(after - before < 0.05);
        assert_eq!(clock.speed_ratio(), 2.0);
    }

    #[test]
    fn negative_ratio_clamps_to_zero() {
        let mut clock = RealTimeClock::new();
        clock.set_speed_ratio(-1.0);
        assert_eq!(clock.speed_ratio(), 0.0);
        clock.restart(4.0);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.position(), 4.0);
    }
}
