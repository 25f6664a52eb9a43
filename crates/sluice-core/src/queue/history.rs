//! Dispatch-history ring for throughput estimation.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Rolling window of recent dispatch timestamps, bounded by a duration.
///
/// `throughput = count / window`. With fewer than two samples the estimate
/// is unknown and callers bypass any check built on it.
#[derive(Debug)]
pub(crate) struct DispatchHistory {
    window: Duration,
    samples: VecDeque<Instant>,
}

impl DispatchHistory {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, at: Instant) {
        self.samples.push_back(at);
        self.prune(at);
    }

    /// Items per second, or `None` while the window is too thin to trust.
    pub(crate) fn throughput(&mut self, now: Instant) -> Option<f64> {
        self.prune(now);
        if self.samples.len() < 2 {
            return None;
        }
        Some(self.samples.len() as f64 / self.window.as_secs_f64())
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(*front) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_below_two_samples() {
        let mut h = DispatchHistory::new(Duration::from_secs(10));
        let now = Instant::now();
        assert_eq!(h.throughput(now), None);
        h.record(now);
        assert_eq!(h.throughput(now), None);
        h.record(now);
        assert!(h.throughput(now).is_some());
    }

    #[tokio::test]
    async fn rate_is_count_over_window() {
        let mut h = DispatchHistory::new(Duration::from_secs(10));
        let now = Instant::now();
        for _ in 0..20 {
            h.record(now);
        }
        let tp = h.throughput(now).unwrap();
        assert!((tp - 2.0).abs() < f64::EPSILON, "got {tp}");
    }

    #[tokio::test]
    async fn old_samples_fall_out_of_the_window() {
        let mut h = DispatchHistory::new(Duration::from_secs(1));
        let start = Instant::now();
        h.record(start);
        h.record(start);
        let later = start + Duration::from_secs(2);
        assert_eq!(h.throughput(later), None);
    }
}
