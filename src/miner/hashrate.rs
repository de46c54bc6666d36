//! Rolling hash rate

use std::collections::VecDeque;
use std::time::Instant;

/// Default number of samples kept in the window
pub const DEFAULT_HASHRATE_WINDOW: usize = 20;

/// Bounded FIFO of per-interval hash rates
#[derive(Debug, Clone)]
pub struct HashrateTracker {
    samples: VecDeque<f64>,
    capacity: usize,
    last_tick: Instant,
}

impl HashrateTracker {
    /// Create a tracker keeping at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            last_tick: Instant::now(),
        }
    }

    /// Record the hashes computed since the previous tick
    pub fn tick(&mut self, hashes: u64) -> f64 {
        self.tick_at(hashes, Instant::now())
    }

    /// Record a sample measured at `now`
    ///
    /// `rate = hashes * 1000 / max(elapsed_ms, 1)`
    pub fn tick_at(&mut self, hashes: u64, now: Instant) -> f64 {
        let elapsed_ms = now.saturating_duration_since(self.last_tick).as_millis().max(1);
        let rate = hashes as f64 * 1000.0 / elapsed_ms as f64;

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rate);
        self.last_tick = now;
        rate
    }

    /// Mean of the window in H/s, 0 before the first sample
    pub fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Drop all samples and restart the interval clock
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_tick = Instant::now();
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HashrateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HASHRATE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_is_zero_until_measured() {
        let tracker = HashrateTracker::default();
        assert_eq!(tracker.rate(), 0.0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_tick_rate_formula() {
        let mut tracker = HashrateTracker::new(4);
        let start = tracker.last_tick;

        let rate = tracker.tick_at(500, start + Duration::from_millis(250));
        assert_eq!(rate, 2000.0);

        // Zero elapsed time counts as one millisecond
        let rate = tracker.tick_at(3, start + Duration::from_millis(250));
        assert_eq!(rate, 3000.0);

        assert_eq!(tracker.rate(), 2500.0);
    }

    #[test]
    fn test_window_is_bounded_fifo() {
        let mut tracker = HashrateTracker::new(3);
        let mut now = tracker.last_tick;
        for hashes in 1..=5u64 {
            now += Duration::from_secs(1);
            tracker.tick_at(hashes * 1000, now);
        }

        assert_eq!(tracker.len(), 3);
        assert_eq!(
            tracker.samples().collect::<Vec<_>>(),
            vec![3000.0, 4000.0, 5000.0]
        );
        assert_eq!(tracker.rate(), 4000.0);

        tracker.reset();
        assert_eq!(tracker.rate(), 0.0);
    }
}
