// Fixed-slot sliding windows for per-tenant request accounting.
//
// A window is a ring of counting slots, each covering one slot_duration.
// Callers pass the observation time explicitly, which keeps rotation
// deterministic and testable.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    slots: Vec<u64>,
    slot_duration: Duration,
    /// Slot index of `anchor`.
    cursor: usize,
    /// Start of the current slot.
    anchor: DateTime<Utc>,
}

impl SlidingWindow {
    pub fn new(slot_count: usize, slot_duration: Duration, at: DateTime<Utc>) -> Self {
        Self {
            slots: vec![0; slot_count.max(1)],
            slot_duration,
            cursor: 0,
            anchor: at,
        }
    }

    /// Advance the ring so the current slot covers `at`, zeroing any slots
    /// skipped over.
    fn rotate_to(&mut self, at: DateTime<Utc>) {
        let elapsed = at - self.anchor;
        if elapsed < self.slot_duration {
            return;
        }
        let millis = self.slot_duration.num_milliseconds().max(1);
        let steps = (elapsed.num_milliseconds() / millis) as usize;
        let steps_capped = steps.min(self.slots.len());
        for _ in 0..steps_capped {
            self.cursor = (self.cursor + 1) % self.slots.len();
            self.slots[self.cursor] = 0;
        }
        self.anchor += self.slot_duration * steps as i32;
    }

    pub fn record(&mut self, count: u64, at: DateTime<Utc>) {
        self.rotate_to(at);
        self.slots[self.cursor] += count;
    }

    pub fn sum(&mut self, at: DateTime<Utc>) -> u64 {
        self.rotate_to(at);
        self.slots.iter().sum()
    }

    pub fn max_slot(&mut self, at: DateTime<Utc>) -> u64 {
        self.rotate_to(at);
        self.slots.iter().copied().max().unwrap_or(0)
    }

    /// Average over non-empty slots; zero when the window is empty.
    pub fn avg_per_slot(&mut self, at: DateTime<Utc>) -> f64 {
        self.rotate_to(at);
        let filled = self.slots.iter().filter(|v| **v > 0).count();
        if filled == 0 {
            return 0.0;
        }
        self.slots.iter().sum::<u64>() as f64 / filled as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::now;

    #[test]
    fn test_record_and_sum_within_slot() {
        let t0 = now();
        let mut w = SlidingWindow::new(60, Duration::minutes(1), t0);
        w.record(3, t0);
        w.record(2, t0 + Duration::seconds(30));
        assert_eq!(w.sum(t0 + Duration::seconds(45)), 5);
    }

    #[test]
    fn test_rotation_drops_old_slots() {
        let t0 = now();
        let mut w = SlidingWindow::new(3, Duration::minutes(1), t0);
        w.record(10, t0);
        w.record(20, t0 + Duration::minutes(1));
        w.record(30, t0 + Duration::minutes(2));
        assert_eq!(w.sum(t0 + Duration::minutes(2)), 60);
        // Minute 3 wraps onto the slot holding 10.
        assert_eq!(w.sum(t0 + Duration::minutes(3)), 50);
        assert_eq!(w.max_slot(t0 + Duration::minutes(3)), 30);
    }

    #[test]
    fn test_long_gap_clears_everything() {
        let t0 = now();
        let mut w = SlidingWindow::new(3, Duration::minutes(1), t0);
        w.record(10, t0);
        assert_eq!(w.sum(t0 + Duration::hours(2)), 0);
    }

    #[test]
    fn test_avg_ignores_empty_slots() {
        let t0 = now();
        let mut w = SlidingWindow::new(7, Duration::days(1), t0);
        w.record(100, t0);
        w.record(300, t0 + Duration::days(1));
        let avg = w.avg_per_slot(t0 + Duration::days(1));
        assert!((avg - 200.0).abs() < f64::EPSILON);
    }
}
