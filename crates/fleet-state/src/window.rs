//! Trailing outcome window for the safe-mode circuit breaker.
//!
//! A fixed ring of time buckets. Recording an outcome lands in the bucket
//! for `now`; a bucket whose start has fallen out of the window is reset
//! the next time its slot is reused, and ignored by `totals` until then.

use serde::{Deserialize, Serialize};

/// Number of buckets in the ring.
pub const WINDOW_BUCKETS: usize = 12;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowBucket {
    pub start: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureWindow {
    pub bucket_secs: u64,
    pub buckets: Vec<WindowBucket>,
    /// Whether the breaker was tripped at the last transition.
    #[serde(default)]
    pub halted: bool,
}

impl FailureWindow {
    /// Create an empty window covering roughly `window_secs`.
    pub fn new(window_secs: u64) -> Self {
        Self {
            bucket_secs: bucket_secs_for(window_secs),
            buckets: vec![WindowBucket::default(); WINDOW_BUCKETS],
            halted: false,
        }
    }

    /// Re-shape the ring if the policy's window length changed. Counts are
    /// dropped in that case; the halted flag survives.
    pub fn align(&mut self, window_secs: u64) {
        let bucket_secs = bucket_secs_for(window_secs);
        if bucket_secs != self.bucket_secs || self.buckets.len() != WINDOW_BUCKETS {
            self.bucket_secs = bucket_secs;
            self.buckets = vec![WindowBucket::default(); WINDOW_BUCKETS];
        }
    }

    pub fn record(&mut self, success: bool, now: u64) {
        let start = now - now % self.bucket_secs;
        let idx = ((now / self.bucket_secs) % WINDOW_BUCKETS as u64) as usize;
        let bucket = &mut self.buckets[idx];
        if bucket.start != start {
            *bucket = WindowBucket {
                start,
                successes: 0,
                failures: 0,
            };
        }
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }

    /// `(successes, failures)` inside the trailing window ending at `now`.
    pub fn totals(&self, now: u64) -> (u64, u64) {
        let current = now - now % self.bucket_secs;
        let oldest = current.saturating_sub(self.bucket_secs * (WINDOW_BUCKETS as u64 - 1));
        self.buckets
            .iter()
            .filter(|b| b.start >= oldest && b.start <= current && (b.successes + b.failures) > 0)
            .fold((0, 0), |(s, f), b| (s + b.successes, f + b.failures))
    }

    /// Drop all recorded outcomes.
    pub fn clear(&mut self) {
        self.buckets = vec![WindowBucket::default(); WINDOW_BUCKETS];
    }
}

fn bucket_secs_for(window_secs: u64) -> u64 {
    window_secs.div_ceil(WINDOW_BUCKETS as u64).max(1)
}
