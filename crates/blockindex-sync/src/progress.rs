//! Replay progress logging.
//!
//! Keeps a sliding window of recent `(instant, height)` samples and logs the
//! replay rate at most once per interval.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::info;

/// A progress report emitted by [`ProgressLog::record`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub height: u32,
    pub target: u32,
    /// Blocks per second over the sample window.
    pub blocks_per_sec: f64,
    /// Share of `target` reached, in `[0, 100]`.
    pub percent: f64,
}

pub struct ProgressLog {
    samples: VecDeque<(Instant, u32)>,
    window: usize,
    interval: Duration,
    last_logged: Option<Instant>,
}

impl ProgressLog {
    pub fn new(window: usize, interval: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.max(2)),
            window: window.max(2),
            interval,
            last_logged: None,
        }
    }

    /// Record that `height` was processed; returns the report if one was logged.
    ///
    /// Every call feeds the rate window; only the log line is throttled.
    pub fn record(&mut self, height: u32, target: u32) -> Option<Progress> {
        let now = Instant::now();
        if self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((now, height));

        let due = self
            .last_logged
            .map_or(true, |at| now.duration_since(at) >= self.interval);
        if !due {
            return None;
        }
        self.last_logged = Some(now);

        let blocks_per_sec = match (self.samples.front(), self.samples.back()) {
            (Some((t0, h0)), Some((t1, h1))) if t1 > t0 => {
                h1.saturating_sub(*h0) as f64 / t1.duration_since(*t0).as_secs_f64()
            }
            _ => 0.0,
        };
        let percent = if target == 0 {
            100.0
        } else {
            (height as f64 / target as f64 * 100.0).min(100.0)
        };

        info!(
            height,
            target,
            blocks_per_sec = format_args!("{blocks_per_sec:.2}"),
            percent = format_args!("{percent:.2}"),
            "Blocks processed"
        );
        Some(Progress {
            height,
            target,
            blocks_per_sec,
            percent,
        })
    }
}

/// 20 samples, one report every 10 seconds.
impl Default for ProgressLog {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_always_logs() {
        let mut log = ProgressLog::default();
        let p = log.record(50, 100).unwrap();
        assert_eq!(p.percent, 50.0);
        assert_eq!(p.blocks_per_sec, 0.0);
    }

    #[test]
    fn throttled_within_interval() {
        let mut log = ProgressLog::new(20, Duration::from_secs(3600));
        assert!(log.record(1, 10).is_some());
        assert!(log.record(2, 10).is_none());
    }

    #[test]
    fn throttled_records_still_fill_window() {
        let mut log = ProgressLog::new(5, Duration::from_secs(3600));
        assert!(log.record(1, 10).is_some());
        for h in 2..=4 {
            assert!(log.record(h, 10).is_none());
        }
        let heights: Vec<u32> = log.samples.iter().map(|(_, h)| *h).collect();
        assert_eq!(heights, vec![1, 2, 3, 4]);
    }

    #[test]
    fn window_is_bounded() {
        let mut log = ProgressLog::new(3, Duration::ZERO);
        for h in 0..10 {
            log.record(h, 10);
        }
        assert_eq!(log.samples.len(), 3);
        assert_eq!(log.samples.front().unwrap().1, 7);
    }

    #[test]
    fn zero_target_is_complete() {
        let mut log = ProgressLog::default();
        assert_eq!(log.record(0, 0).unwrap().percent, 100.0);
    }
}
