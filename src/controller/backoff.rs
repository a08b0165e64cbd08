//! # Fibonacci Backoff
//!
//! Retry intervals that grow along the Fibonacci sequence (in minutes) and
//! stop growing at a maximum: 1m, 1m, 2m, 3m, 5m, 8m, 10m, 10m, ...

use std::time::Duration;

/// Stateful Fibonacci backoff between `min_minutes` and `max_minutes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    max_minutes: u64,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        let min_minutes = min_minutes.max(1);
        Self {
            min_minutes,
            max_minutes: max_minutes.max(min_minutes),
            previous: 0,
            current: min_minutes,
        }
    }

    /// Next interval in seconds; advances the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let minutes = self.current.min(self.max_minutes);
        if self.current < self.max_minutes {
            let next = self.previous.saturating_add(self.current);
            self.previous = self.current;
            self.current = next;
        }
        minutes * 60
    }

    pub fn reset(&mut self) {
        self.previous = 0;
        self.current = self.min_minutes;
    }

    /// Interval after `error_count` consecutive errors (0-indexed), without state
    pub fn calculate_for_error_count(error_count: u32, min_minutes: u64, max_minutes: u64) -> Duration {
        let mut backoff = Self::new(min_minutes, max_minutes);
        let mut seconds = backoff.next_backoff_seconds();
        for _ in 0..error_count {
            seconds = backoff.next_backoff_seconds();
            if seconds >= backoff.max_minutes * 60 {
                break;
            }
        }
        Duration::from_secs(seconds)
    }
}
