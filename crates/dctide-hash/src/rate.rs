//! Sliding-window transfer rate accounting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Byte counter with a windowed per-second average.
///
/// Each connection keeps one per direction; the process keeps two more
/// for the global network-in/out totals.
#[derive(Debug, Clone)]
pub struct RateCalc {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl RateCalc {
    /// Counter with the default 10-second window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Counter with an explicit averaging window.
    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        RateCalc {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Record transferred bytes.
    pub fn add(&mut self, bytes: u64) {
        self.add_at(Instant::now(), bytes);
    }

    pub(crate) fn add_at(&mut self, now: Instant, bytes: u64) {
        self.total = self.total.saturating_add(bytes);
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average bytes per second over the window.
    #[must_use]
    pub fn rate(&mut self) -> u64 {
        self.rate_at(Instant::now())
    }

    pub(crate) fn rate_at(&mut self, now: Instant) -> u64 {
        self.prune(now);
        let sum: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        sum / self.window.as_secs().max(1)
    }

    /// Estimated seconds until `remaining` bytes are done, at the
    /// current rate. `None` while the rate is zero.
    #[must_use]
    pub fn eta(&mut self, remaining: u64) -> Option<u64> {
        let r = self.rate();
        if r == 0 {
            None
        } else {
            Some(remaining.div_ceil(r))
        }
    }

    /// Lifetime byte total.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Default for RateCalc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_accumulates() {
        let mut rc = RateCalc::new();
        rc.add(100);
        rc.add(50);
        assert_eq!(rc.total(), 150);
    }

    #[test]
    fn test_rate_over_window() {
        let mut rc = RateCalc::with_window(Duration::from_secs(10));
        let t0 = Instant::now();
        for i in 0..10 {
            rc.add_at(t0 + Duration::from_secs(i), 1000);
        }
        assert_eq!(rc.rate_at(t0 + Duration::from_secs(9)), 1000);
    }

    #[test]
    fn test_old_samples_expire() {
        let mut rc = RateCalc::with_window(Duration::from_secs(10));
        let t0 = Instant::now();
        rc.add_at(t0, 5000);
        assert_eq!(rc.rate_at(t0 + Duration::from_secs(30)), 0);
        assert_eq!(rc.total(), 5000);
    }

    #[test]
    fn test_eta() {
        let mut rc = RateCalc::with_window(Duration::from_secs(1));
        assert_eq!(rc.eta(100), None);
        rc.add(200);
        assert_eq!(rc.eta(100), Some(1));
    }
}
