//! Moving window over recent tick durations

use std::collections::VecDeque;
use std::time::Duration;

/// A tick at least this many times the window average is reported as long
const LONG_TICK_FACTOR: f64 = 1.5;

/// Samples required before long ticks are reported
const MIN_SAMPLES_FOR_DETECTION: usize = 3;

/// Fixed-capacity window of the most recent tick durations
#[derive(Debug, Clone)]
pub struct TickWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl TickWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Mean of the samples currently in the window, in seconds
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Record a tick; returns the prior average if this tick was long
    pub fn record(&mut self, duration: Duration) -> Option<f64> {
        let secs = duration.as_secs_f64();

        let long_tick = match self.average() {
            Some(avg) if self.samples.len() >= MIN_SAMPLES_FOR_DETECTION.min(self.capacity) => {
                (secs >= avg * LONG_TICK_FACTOR).then_some(avg)
            }
            _ => None,
        };

        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.samples.push_back(secs);
        self.sum += secs;

        long_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_over_window() {
        let mut window = TickWindow::new(3);
        assert!(window.average().is_none());

        for secs in [1, 2, 3, 4] {
            window.record(Duration::from_secs(secs));
        }

        assert_eq!(window.len(), 3);
        assert!((window.average().unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_long_tick_requires_history() {
        let mut window = TickWindow::new(16);
        assert!(window.record(Duration::from_secs(1)).is_none());
        // only one prior sample, not enough to judge
        assert!(window.record(Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_long_tick_detected() {
        let mut window = TickWindow::new(16);
        for _ in 0..3 {
            window.record(Duration::from_secs(1));
        }

        assert!(window.record(Duration::from_millis(1400)).is_none());
        let avg = window.record(Duration::from_secs(5)).unwrap();
        assert!(avg > 1.0 && avg < 1.2);
    }
}
