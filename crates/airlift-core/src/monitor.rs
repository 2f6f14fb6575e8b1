//! Adaptive stream-count controller.
//!
//! Watches recent throughput and recommends adding a stream when speed has
//! plateaued below target, or dropping one when comfortably above it.
//! Deterministic given the sample sequence.

use std::collections::VecDeque;

use crate::{MAX_STREAMS, MIN_STREAMS};

/// Samples kept in the sliding history.
const HISTORY_CAPACITY: usize = 10;

/// Samples averaged for the "recent" window.
const RECENT_WINDOW: usize = 3;

/// Throughput target in bytes per second (10 MB/s).
const TARGET_SPEED: f64 = 10.0 * 1024.0 * 1024.0;

/// Relative band within which speed counts as plateaued.
const PLATEAU_BAND: f64 = 0.10;

/// Bounded history of throughput samples with a stream-count recommendation.
#[derive(Debug, Default)]
pub struct SpeedMonitor {
    history: VecDeque<f64>,
}

impl SpeedMonitor {
    /// Create an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one throughput sample (bytes/sec), evicting the oldest beyond
    /// capacity.
    pub fn record_speed(&mut self, bytes_per_sec: f64) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(bytes_per_sec);
    }

    /// Mean over the whole history, zero when empty.
    #[must_use]
    pub fn average_speed(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }

    /// Recommend a new stream count, or `None` to keep the current one.
    ///
    /// Never adjusts with fewer than three samples. Below target on a
    /// plateau, adds a stream (cap 8); above 1.5x target, removes one
    /// (floor 1).
    #[must_use]
    pub fn should_adjust(&self, current_streams: usize) -> Option<usize> {
        if self.history.len() < RECENT_WINDOW {
            return None;
        }

        let recent = self
            .history
            .iter()
            .rev()
            .take(RECENT_WINDOW)
            .sum::<f64>()
            / RECENT_WINDOW as f64;
        let average = self.average_speed();

        if recent < TARGET_SPEED && current_streams < MAX_STREAMS && average > 0.0 {
            let variation = (recent - average).abs() / average;
            if variation < PLATEAU_BAND {
                return Some((current_streams + 1).min(MAX_STREAMS));
            }
        }

        if recent > TARGET_SPEED * 1.5 && current_streams > MIN_STREAMS {
            return Some((current_streams - 1).max(MIN_STREAMS));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: f64 = 1024.0 * 1024.0;

    fn monitor_with(samples: &[f64]) -> SpeedMonitor {
        let mut monitor = SpeedMonitor::new();
        for &sample in samples {
            monitor.record_speed(sample);
        }
        monitor
    }

    #[test]
    fn never_adjusts_with_fewer_than_three_samples() {
        assert_eq!(monitor_with(&[]).should_adjust(2), None);
        assert_eq!(monitor_with(&[1.0 * MB]).should_adjust(2), None);
        assert_eq!(monitor_with(&[1.0 * MB, 1.0 * MB]).should_adjust(2), None);
    }

    #[test]
    fn slow_plateau_recommends_increase() {
        let monitor = monitor_with(&[1.0 * MB, 1.0 * MB, 1.0 * MB]);
        assert_eq!(monitor.should_adjust(2), Some(3));
    }

    #[test]
    fn fast_transfer_recommends_decrease() {
        let monitor = monitor_with(&[20.0 * MB, 20.0 * MB, 20.0 * MB]);
        assert_eq!(monitor.should_adjust(4), Some(3));
    }

    #[test]
    fn respects_stream_bounds() {
        let slow = monitor_with(&[1.0 * MB, 1.0 * MB, 1.0 * MB]);
        assert_eq!(slow.should_adjust(8), None);

        let fast = monitor_with(&[20.0 * MB, 20.0 * MB, 20.0 * MB]);
        assert_eq!(fast.should_adjust(1), None);
    }

    #[test]
    fn rising_speed_below_target_holds() {
        // Recent mean far from the history mean: not a plateau.
        let monitor = monitor_with(&[1.0 * MB, 1.0 * MB, 1.0 * MB, 5.0 * MB, 6.0 * MB, 7.0 * MB]);
        assert_eq!(monitor.should_adjust(2), None);
    }

    #[test]
    fn history_is_bounded() {
        let mut monitor = SpeedMonitor::new();
        for i in 0..50 {
            monitor.record_speed(f64::from(i));
        }
        // Only the last 10 samples remain: 40..=49.
        assert!((monitor.average_speed() - 44.5).abs() < f64::EPSILON);
    }

    #[test]
    fn determinism() {
        let a = monitor_with(&[1.0 * MB, 1.0 * MB, 1.0 * MB]);
        let b = monitor_with(&[1.0 * MB, 1.0 * MB, 1.0 * MB]);
        assert_eq!(a.should_adjust(4), b.should_adjust(4));
    }
}
