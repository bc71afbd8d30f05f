//! Windowed moving-average bitrate meter (C1).
//!
//! Accumulates bytes into 1-second buckets and reports the mean of the last
//! *W* closed buckets. Not thread-safe; the Pacing Engine owns one instance
//! per file plus one for the whole session and only ever touches them from
//! the send loop.

use std::collections::VecDeque;
use std::time::Instant;

/// A moving-average bytes/s -> bit/s meter over a bounded window of
/// 1-second buckets.
pub struct BitrateMeter {
    window: usize,
    buckets: VecDeque<u64>,
    current_bucket_bytes: u64,
    current_bucket_started: Instant,
    total_bytes: u64,
    created_at: Instant,
}

impl BitrateMeter {
    /// Creates a meter with a window of `window` one-second buckets.
    #[must_use]
    pub fn new(window: usize) -> Self {
        let now = Instant::now();
        Self {
            window: window.max(1),
            buckets: VecDeque::with_capacity(window.max(1)),
            current_bucket_bytes: 0,
            current_bucket_started: now,
            total_bytes: 0,
            created_at: now,
        }
    }

    /// Accumulates `bytes` into the current bucket. Closes and emits the
    /// bucket once it has been open for at least one second.
    pub fn add(&mut self, bytes: u64) {
        self.current_bucket_bytes += bytes;
        self.total_bytes += bytes;

        if self.current_bucket_started.elapsed().as_secs_f64() >= 1.0 {
            self.close_bucket();
        }
    }

    fn close_bucket(&mut self) {
        if self.buckets.len() == self.window {
            self.buckets.pop_front();
        }
        self.buckets.push_back(self.current_bucket_bytes);
        self.current_bucket_bytes = 0;
        self.current_bucket_started = Instant::now();
    }

    /// Returns the current average bitrate in bits/s.
    ///
    /// If no bucket has closed yet but bytes have been added, falls back to
    /// a coarse estimate over the meter's whole lifetime. Never divides by
    /// zero.
    #[must_use]
    pub fn bitrate(&self) -> f64 {
        if !self.buckets.is_empty() {
            let sum: u64 = self.buckets.iter().sum();
            let mean_bytes_per_sec = sum as f64 / self.buckets.len() as f64;
            return mean_bytes_per_sec * 8.0;
        }

        if self.total_bytes == 0 {
            return 0.0;
        }

        let elapsed = self.created_at.elapsed().as_secs_f64().max(f64::MIN_POSITIVE);
        (self.total_bytes as f64 * 8.0) / elapsed
    }

    /// Lifetime total bytes added to this meter.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn bitrate_is_zero_with_no_data() {
        let meter = BitrateMeter::new(5);
        assert_eq!(meter.bitrate(), 0.0);
        assert_eq!(meter.total_bytes(), 0);
    }

    #[test]
    fn coarse_estimate_before_first_bucket_closes() {
        let mut meter = BitrateMeter::new(5);
        meter.add(1000);
        // No bucket has closed yet (elapsed < 1s), so this falls back to
        // the lifetime-rate estimate rather than reporting zero.
        assert!(meter.bitrate() > 0.0);
        assert_eq!(meter.total_bytes(), 1000);
    }

    #[test]
    fn bucket_closes_after_one_second_and_feeds_average() {
        let mut meter = BitrateMeter::new(2);
        meter.add(1250); // 1250 bytes = 10_000 bits
        sleep(Duration::from_millis(1050));
        meter.add(0); // forces the elapsed check to close the bucket
        assert_eq!(meter.bitrate(), 10_000.0);
    }

    #[test]
    fn window_is_bounded() {
        let mut meter = BitrateMeter::new(2);
        for _ in 0..3 {
            meter.add(100);
            sleep(Duration::from_millis(1010));
            meter.add(0);
        }
        assert!(meter.buckets.len() <= 2);
    }

    #[test]
    fn total_bytes_accumulates_across_buckets() {
        let mut meter = BitrateMeter::new(3);
        meter.add(500);
        sleep(Duration::from_millis(1010));
        meter.add(500);
        assert_eq!(meter.total_bytes(), 1000);
    }
}
